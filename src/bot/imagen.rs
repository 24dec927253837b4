//! `/imagen` and `/imagencancel` command flow.

use super::command::{parse_imagen_args, plan, ImageSource, ImagenArgs, ImagenPlan};
use super::media::has_attachment;
use super::outbound::CommandIo;
use crate::collect::{CollectionOutcome, ImageItem, SessionRegistry};
use crate::config::TELEGRAM_CAPTION_LIMIT;
use crate::imagen::ImageGenerator;
use crate::typing::TypingHandle;
use crate::utils::truncate_str;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{ChatAction, ChatId, MessageId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Prefix of every user-visible error reply
pub const ERROR_PREFIX: &str = "❌ Error";
/// Asks the user to post the images to edit
pub const UPLOAD_PROMPT: &str = "🩻 Please post the image file(s) to process.";
/// Confirms `/imagencancel`
pub const CANCEL_CONFIRMATION: &str = "❌ Canceling waiting for image data";

/// Identity of one command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandContext {
    /// Chat the command was sent in
    pub chat_id: ChatId,
    /// The command message
    pub message_id: MessageId,
    /// Sender of the command
    pub user_id: i64,
    /// The command replies to a photo or document
    pub reply_has_attachment: bool,
}

impl CommandContext {
    /// Context of the command message `msg`.
    #[must_use]
    pub fn from_message(msg: &Message) -> Self {
        Self {
            chat_id: msg.chat.id,
            message_id: msg.id,
            user_id: super::handlers::get_user_id_safe(msg),
            reply_has_attachment: msg.reply_to_message().is_some_and(has_attachment),
        }
    }
}

/// Shared state of the image commands.
pub struct ImagenService {
    generator: Arc<dyn ImageGenerator>,
    registry: Arc<SessionRegistry>,
    typing: TypingHandle,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ImagenService {
    /// Create the service.
    ///
    /// Commands started through it are aborted when `shutdown` is cancelled.
    #[must_use]
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        registry: Arc<SessionRegistry>,
        typing: TypingHandle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            generator,
            registry,
            typing,
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    /// Registry of commands waiting for attachments.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Run `/imagen` on its own task.
    ///
    /// Commands may wait minutes for attachments; running them detached keeps
    /// the dispatcher free to deliver those attachments.
    pub fn spawn_imagen<Io>(
        self: &Arc<Self>,
        io: Io,
        ctx: CommandContext,
        text: String,
    ) -> JoinHandle<()>
    where
        Io: CommandIo + 'static,
    {
        let service = Arc::clone(self);
        let cancel = self.shutdown.child_token();
        self.tasks.spawn(async move {
            service.run_imagen(&io, &ctx, &text, &cancel).await;
        })
    }

    /// Hand an inbound attachment of `user_id` to their waiting command.
    ///
    /// `fetch` runs on its own task, so the downloads of an album overlap
    /// instead of queueing behind each other. Returns `None` without polling
    /// `fetch` when nobody waits for `user_id`.
    pub fn spawn_delivery<F>(&self, user_id: i64, fetch: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = Option<ImageItem>> + Send + 'static,
    {
        if !self.registry.is_waiting(user_id) {
            return None;
        }

        let registry = Arc::clone(&self.registry);
        Some(self.tasks.spawn(async move {
            let Some(item) = fetch.await else {
                return;
            };
            if !registry.deliver(user_id, item).await {
                debug!(user_id, "Waiting command finished before the attachment arrived");
            }
        }))
    }

    /// Abort every running command and wait until each has sent its last reply.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        info!(running = self.tasks.len(), "Waiting for running commands");
        self.tasks.wait().await;
    }

    /// Serve one `/imagen` command. Every failure ends in a reply.
    pub async fn run_imagen(
        &self,
        io: &dyn CommandIo,
        ctx: &CommandContext,
        text: &str,
        cancel: &CancellationToken,
    ) {
        let args = match parse_imagen_args(text) {
            Ok(args) => args,
            Err(e) => {
                warn!(user_id = ctx.user_id, error = %e, "Invalid imagen arguments");
                reply_error(io, &e).await;
                return;
            }
        };

        let plan = plan(&args, ctx.reply_has_attachment);
        info!(
            user_id = ctx.user_id,
            n = args.candidate_count,
            ?plan,
            prompt = %args.prompt,
            "Parsed imagen args"
        );

        let images = match plan {
            ImagenPlan::Generate => Vec::new(),
            ImagenPlan::Edit(source) => {
                let Some(images) = self.collect_images(io, ctx, source, cancel).await else {
                    return;
                };
                images
            }
        };

        self.generate_and_upload(io, ctx, &args, &images, cancel)
            .await;
    }

    /// Serve `/imagencancel` for `user_id`.
    pub async fn cancel(&self, io: &dyn CommandIo, user_id: i64) {
        match self.registry.cancel_for(user_id).await {
            Ok(()) => reply(io, CANCEL_CONFIRMATION).await,
            Err(e) => {
                info!(user_id, "No command waiting for image data");
                reply_error(io, &e).await;
            }
        }
    }

    /// Returns `None` when the command should stop; the user has already been
    /// told why, unless the collection was cancelled on request.
    async fn collect_images(
        &self,
        io: &dyn CommandIo,
        ctx: &CommandContext,
        source: ImageSource,
        cancel: &CancellationToken,
    ) -> Option<Vec<ImageItem>> {
        let collector = self.registry.begin(ctx.user_id);

        let outcome = match source {
            ImageSource::RepliedAttachment => {
                let handle = collector.delivery_handle();
                let feed = async {
                    match io.fetch_replied_attachment().await {
                        Ok(item) => {
                            handle.deliver(item).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to fetch the replied attachment");
                            reply_error(io, &e).await;
                            handle.cancel().await;
                        }
                    }
                };
                let ((), outcome) = tokio::join!(feed, collector.collect(cancel));
                outcome
            }
            ImageSource::Upload => {
                reply(io, UPLOAD_PROMPT).await;
                collector.collect(cancel).await
            }
        };

        match outcome {
            Ok(CollectionOutcome::Batch(images)) => Some(images),
            Ok(CollectionOutcome::Cancelled) => None,
            Err(e) => {
                reply_error(io, &e).await;
                None
            }
        }
    }

    async fn generate_and_upload(
        &self,
        io: &dyn CommandIo,
        ctx: &CommandContext,
        args: &ImagenArgs,
        images: &[ImageItem],
        cancel: &CancellationToken,
    ) {
        let typing = self
            .typing
            .start(ctx.chat_id, ctx.message_id, ChatAction::Typing);

        let result = tokio::select! {
            result = self.generator.generate(&args.prompt, images, args.candidate_count) => result,
            () = cancel.cancelled() => {
                info!(user_id = ctx.user_id, "Generation aborted by shutdown");
                return;
            }
        };

        let generated = match result {
            Ok(generated) => generated,
            Err(e) => {
                error!(user_id = ctx.user_id, error = %e, "Generation failed");
                for text in e.texts() {
                    reply(io, text).await;
                }
                reply_error(io, &e).await;
                return;
            }
        };

        typing.set(ChatAction::UploadPhoto);
        for text in &generated.texts {
            reply(io, text).await;
        }

        let count = generated.images.len();
        let caption = truncate_str(format!("💭 {}", args.prompt), TELEGRAM_CAPTION_LIMIT);
        info!(count, "Uploading images");
        match io.upload_images(&caption, generated.images).await {
            Ok(()) => info!(count, "Images uploaded successfully"),
            Err(e) => {
                error!(error = %e, "Upload failed");
                reply_error(io, &e).await;
            }
        }
    }
}

async fn reply(io: &dyn CommandIo, text: &str) {
    if let Err(e) = io.reply(text).await {
        error!(error = %e, "Failed to send reply");
    }
}

async fn reply_error(io: &dyn CommandIo, e: &(dyn Display + Sync)) {
    reply(io, &format!("{ERROR_PREFIX}: {e}")).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::outbound::MockCommandIo;
    use crate::collect::CollectTimeouts;
    use crate::imagen::{GeneratedImages, GenerationError, MockImageGenerator};
    use crate::typing::{TypingCoalescer, TypingSignaler};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct NoopSignaler;

    #[async_trait]
    impl TypingSignaler for NoopSignaler {
        async fn send_action(&self, _: ChatId, _: ChatAction) -> anyhow::Result<()> {
            Ok(())
        }
    }

    const USER: i64 = 42;

    fn ctx(reply_has_attachment: bool) -> CommandContext {
        CommandContext {
            chat_id: ChatId(-100),
            message_id: MessageId(7),
            user_id: USER,
            reply_has_attachment,
        }
    }

    fn service(generator: MockImageGenerator) -> Arc<ImagenService> {
        let shutdown = CancellationToken::new();
        let (typing, _task) = TypingCoalescer::spawn(
            Arc::new(NoopSignaler),
            Duration::from_secs(4),
            shutdown.clone(),
        );
        let registry = Arc::new(SessionRegistry::new(CollectTimeouts {
            first_image: Duration::from_secs(180),
            quiet_window: Duration::from_secs(1),
        }));
        Arc::new(ImagenService::new(
            Arc::new(generator),
            registry,
            typing,
            shutdown,
        ))
    }

    fn one_image() -> GeneratedImages {
        GeneratedImages {
            images: vec![vec![1, 2, 3]],
            texts: Vec::new(),
        }
    }

    fn photo(n: u8) -> ImageItem {
        ImageItem::new(vec![n], format!("photo_{n}.jpg"), "image/jpeg")
    }

    async fn wait_until_waiting(service: &ImagenService) {
        while !service.registry().is_waiting(USER) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_prompt_generates_directly() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .withf(|prompt, images, n| prompt.to_string() == "a cat" && images.is_empty() && *n == 1)
            .times(1)
            .returning(|_, _, _| Ok(one_image()));

        let mut io = MockCommandIo::new();
        io.expect_upload_images()
            .withf(|caption, images| caption.to_string() == "💭 a cat" && images.len() == 1)
            .times(1)
            .returning(|_, _| Ok(()));

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(false), "a cat", &CancellationToken::new())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_candidate_count_flag_reaches_generator() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .withf(|prompt, _, n| prompt.to_string() == "a cat" && *n == 3)
            .times(1)
            .returning(|_, _, _| Ok(one_image()));

        let mut io = MockCommandIo::new();
        io.expect_upload_images().times(1).returning(|_, _| Ok(()));

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(false), "-n 3 a cat", &CancellationToken::new())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_to_photo_edits_without_prompting() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .withf(|prompt, images, n| {
                prompt.to_string() == "make it blue" && images.len() == 1 && *n == 1
            })
            .times(1)
            .returning(|_, _, _| Ok(one_image()));

        // No `reply` expectation: asking for an upload would panic the mock.
        let mut io = MockCommandIo::new();
        io.expect_fetch_replied_attachment()
            .times(1)
            .returning(|| Ok(photo(1)));
        io.expect_upload_images().times(1).returning(|_, _| Ok(()));

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(true), "make it blue", &CancellationToken::new())
            .await;
        assert_eq!(service.registry().waiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reply_fetch_ends_quietly_after_error() {
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().never();

        let mut io = MockCommandIo::new();
        io.expect_fetch_replied_attachment()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("download failed")));
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: download failed")
            .times(1)
            .returning(|_| Ok(()));

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(true), "make it blue", &CancellationToken::new())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploaded_burst_becomes_one_request() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .withf(|_, images, _| images.len() == 3)
            .times(1)
            .returning(|_, _, _| Ok(one_image()));

        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == UPLOAD_PROMPT)
            .times(1)
            .returning(|_| Ok(()));
        io.expect_upload_images().times(1).returning(|_, _| Ok(()));

        let service = service(generator);
        let task = service.spawn_imagen(io, ctx(false), "-edit make it blue".to_string());

        wait_until_waiting(&service).await;
        for n in 0..3 {
            assert!(service.registry().deliver(USER, photo(n)).await);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        assert!(task.await.is_ok());
        assert!(!service.registry().is_waiting(USER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_ends_wait_silently() {
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().never();

        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == UPLOAD_PROMPT)
            .times(1)
            .returning(|_| Ok(()));

        let service = service(generator);
        let task = service.spawn_imagen(io, ctx(false), "-edit make it blue".to_string());
        wait_until_waiting(&service).await;

        let mut cancel_io = MockCommandIo::new();
        cancel_io
            .expect_reply()
            .withf(|text| text.to_string() == CANCEL_CONFIRMATION)
            .times(1)
            .returning(|_| Ok(()));
        service.cancel(&cancel_io, USER).await;

        assert!(!service.registry().is_waiting(USER));
        assert!(task.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_without_waiting_command() {
        let service = service(MockImageGenerator::new());

        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: not waiting for image data")
            .times(1)
            .returning(|_| Ok(()));
        service.cancel(&io, USER).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_is_reported() {
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().never();

        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == UPLOAD_PROMPT)
            .times(1)
            .returning(|_| Ok(()));
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: waiting for image data timeout")
            .times(1)
            .returning(|_| Ok(()));

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(false), "-edit a cat", &CancellationToken::new())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_arguments_are_reported() {
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().never();

        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: No prompt provided")
            .times(1)
            .returning(|_| Ok(()));
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: Missing value for flag: n")
            .times(1)
            .returning(|_| Ok(()));

        let service = service(generator);
        let cancel = CancellationToken::new();
        service.run_imagen(&io, &ctx(false), "-n 2", &cancel).await;
        service.run_imagen(&io, &ctx(false), "a cat -n", &cancel).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_error_is_reported() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .times(1)
            .returning(|_, _, _| Err(GenerationError::Blocked("unsafe prompt".to_string())));

        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: prompt blocked: unsafe prompt")
            .times(1)
            .returning(|_| Ok(()));

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(false), "a cat", &CancellationToken::new())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_text_is_sent_before_upload() {
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().times(1).returning(|_, _, _| {
            Ok(GeneratedImages {
                images: vec![vec![1], vec![2]],
                texts: vec!["Here are two cats".to_string()],
            })
        });

        let mut seq = mockall::Sequence::new();
        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == "Here are two cats")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        io.expect_upload_images()
            .withf(|_, images| images.len() == 2)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(false), "-n 2 two cats", &CancellationToken::new())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_error_is_reported() {
        let mut generator = MockImageGenerator::new();
        generator
            .expect_generate()
            .times(1)
            .returning(|_, _, _| Ok(one_image()));

        let mut io = MockCommandIo::new();
        io.expect_upload_images()
            .times(1)
            .returning(|_, _| Err(anyhow::anyhow!("Telegram upload error: too big")));
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: Telegram upload error: too big")
            .times(1)
            .returning(|_| Ok(()));

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(false), "a cat", &CancellationToken::new())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_waiting_command() {
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().never();

        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == UPLOAD_PROMPT)
            .times(1)
            .returning(|_| Ok(()));
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: waiting for image data aborted")
            .times(1)
            .returning(|_| Ok(()));

        let service = service(generator);
        let cancel = CancellationToken::new();
        let ctx = ctx(false);
        let run = service.run_imagen(&io, &ctx, "-edit a cat", &cancel);
        let abort = async {
            wait_until_waiting(&service).await;
            cancel.cancel();
        };
        tokio::join!(run, abort);
        assert!(!service.registry().is_waiting(USER));
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_command_futures_are_send() {
        let service = service(MockImageGenerator::new());
        let io = MockCommandIo::new();
        let ctx = ctx(false);
        let cancel = CancellationToken::new();

        let run = service.run_imagen(&io, &ctx, "a cat", &cancel);
        assert_send(&run);
        let cancel_command = service.cancel(&io, USER);
        assert_send(&cancel_command);
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_refusal_is_sent_before_error() {
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().times(1).returning(|_, _, _| {
            Err(GenerationError::NoImages {
                texts: vec!["I can't draw that because of policy X".to_string()],
            })
        });

        let mut seq = mockall::Sequence::new();
        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == "I can't draw that because of policy X")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: no images generated")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        io.expect_upload_images().never();

        let service = service(generator);
        service
            .run_imagen(&io, &ctx(false), "a forbidden cat", &CancellationToken::new())
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_final_reply() {
        let mut generator = MockImageGenerator::new();
        generator.expect_generate().never();

        let aborted = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&aborted);
        let mut io = MockCommandIo::new();
        io.expect_reply()
            .withf(|text| text.to_string() == UPLOAD_PROMPT)
            .times(1)
            .returning(|_| Ok(()));
        io.expect_reply()
            .withf(|text| text.to_string() == "❌ Error: waiting for image data aborted")
            .times(1)
            .returning(move |_| {
                seen.store(true, Ordering::SeqCst);
                Ok(())
            });

        let service = service(generator);
        let _task = service.spawn_imagen(io, ctx(false), "-edit a cat".to_string());
        wait_until_waiting(&service).await;

        service.shutdown().await;
        assert!(aborted.load(Ordering::SeqCst));
        assert!(!service.registry().is_waiting(USER));
    }

    #[tokio::test]
    async fn test_delivery_skipped_when_nobody_waits() {
        let service = service(MockImageGenerator::new());
        let polled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&polled);

        let task = service.spawn_delivery(USER, async move {
            flag.store(true, Ordering::SeqCst);
            Some(photo(0))
        });

        assert!(task.is_none());
        tokio::task::yield_now().await;
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_album_downloads_overlap() {
        let service = service(MockImageGenerator::new());
        let collector = service.registry().begin(USER);
        let cancel = CancellationToken::new();

        // Started together, the slow download lands 950 ms after the fast one.
        // Back to back it would land past the quiet window.
        let slow = service.spawn_delivery(USER, async {
            tokio::time::sleep(Duration::from_millis(1050)).await;
            Some(photo(2))
        });
        let fast = service.spawn_delivery(USER, async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Some(photo(1))
        });
        assert!(slow.is_some() && fast.is_some());

        let outcome = collector.collect(&cancel).await;
        let Ok(CollectionOutcome::Batch(items)) = outcome else {
            panic!("expected a batch");
        };
        let names: Vec<&str> = items.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, ["photo_1.jpg", "photo_2.jpg"]);
    }
}

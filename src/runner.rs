use crate::bot;
use crate::bot::command::Command;
use crate::bot::handlers::get_user_id_safe;
use crate::bot::imagen::ImagenService;
use crate::collect::{CollectTimeouts, SessionRegistry};
use crate::config::Settings;
use crate::imagen::ImageGenerator;
use crate::typing::TypingCoalescer;
use std::sync::Arc;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Run the Telegram runtime until Ctrl-C.
///
/// Background work (waiting commands, running generations and the typing
/// coalescer) is cancelled once the dispatcher stops.
pub async fn run_bot(settings: Arc<Settings>, generator: Arc<dyn ImageGenerator>) {
    let bot = Bot::new(settings.telegram_token.clone());
    let shutdown = CancellationToken::new();

    let (typing, typing_task) = TypingCoalescer::spawn(
        Arc::new(bot.clone()),
        settings.typing_refresh_interval(),
        shutdown.clone(),
    );
    let registry = Arc::new(SessionRegistry::new(CollectTimeouts::from_settings(
        &settings,
    )));
    let service = Arc::new(ImagenService::new(
        generator,
        registry,
        typing,
        shutdown.clone(),
    ));
    info!(
        allowed_users = settings.allowed_users().len(),
        allowed_chats = settings.allowed_chats().len(),
        "Access control configured"
    );

    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![settings, Arc::clone(&service)])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Dispatcher stopped, shutting down background tasks");
    service.shutdown().await;
    if let Err(e) = typing_task.await {
        error!("Typing coalescer task failed: {}", e);
    }
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .branch(
            dptree::filter(|msg: Message, settings: Arc<Settings>| {
                settings.is_allowed(get_user_id_safe(&msg), msg.chat.id.0)
            })
            .branch(
                dptree::entry()
                    .filter_command::<Command>()
                    .endpoint(handle_command),
            )
            .branch(
                dptree::filter(|msg: Message| bot::media::has_attachment(&msg))
                    .endpoint(handle_attachment),
            ),
        )
        .branch(dptree::endpoint(handle_unauthorized))
}

async fn handle_unauthorized(msg: Message) -> Result<(), teloxide::RequestError> {
    debug!(
        user_id = get_user_id_safe(&msg),
        chat_id = msg.chat.id.0,
        "Ignoring message from unauthorized user or chat"
    );
    respond(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    service: Arc<ImagenService>,
) -> Result<(), teloxide::RequestError> {
    match cmd {
        Command::Imagen(text) => bot::handlers::imagen(bot, msg, text, &service),
        Command::ImagenCancel => bot::handlers::imagen_cancel(bot, msg, &service).await,
        Command::ImagenHelp => {
            if let Err(e) = bot::handlers::imagen_help(bot, msg).await {
                error!("Command error: {}", e);
            }
        }
    }
    respond(())
}

async fn handle_attachment(
    bot: Bot,
    msg: Message,
    service: Arc<ImagenService>,
) -> Result<(), teloxide::RequestError> {
    bot::handlers::deliver_attachment(bot, msg, &service);
    respond(())
}

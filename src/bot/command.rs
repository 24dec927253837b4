//! Command surface: commands, `/imagen` argument parsing and request planning.

use teloxide::utils::command::BotCommands;
use thiserror::Error;

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Generate or edit images
    #[command(description = "generate or edit images: /imagen [-edit] [-n count] prompt")]
    Imagen(String),
    /// Cancel an in-flight wait for attachments
    #[command(description = "cancel waiting for images.")]
    ImagenCancel,
    /// Show help
    #[command(description = "show help.")]
    ImagenHelp,
}

/// Parsed `/imagen` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagenArgs {
    /// Prompt with all flags removed
    pub prompt: String,
    /// Number of candidates to request
    pub candidate_count: u32,
    /// `-edit` was given
    pub force_edit: bool,
}

/// Invalid `/imagen` input
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsError {
    /// A flag that takes a value was last or followed by another flag
    #[error("Missing value for flag: {0}")]
    MissingValue(String),
    /// A flag value could not be used
    #[error("Invalid value for {flag}: {value}")]
    InvalidValue {
        /// Flag name without the dash
        flag: String,
        /// Offending value
        value: String,
    },
    /// Nothing left after removing flags
    #[error("No prompt provided")]
    EmptyPrompt,
}

/// Parse the text after `/imagen`.
///
/// Words starting with `-` are flags: `-edit` forces edit mode and `-n <count>`
/// sets the candidate count. Unknown flags are dropped. Every other word
/// belongs to the prompt.
///
/// # Examples
///
/// ```
/// use imagen_bot::bot::command::parse_imagen_args;
///
/// let args = parse_imagen_args("-n 3 a cat").expect("valid arguments");
/// assert_eq!(args.prompt, "a cat");
/// assert_eq!(args.candidate_count, 3);
/// ```
///
/// # Errors
///
/// Returns an [`ArgsError`] for a missing or invalid flag value or an empty
/// prompt.
pub fn parse_imagen_args(text: &str) -> Result<ImagenArgs, ArgsError> {
    let mut candidate_count = 1;
    let mut force_edit = false;
    let mut prompt_parts = Vec::new();

    let mut words = text.split_whitespace().peekable();
    while let Some(word) = words.next() {
        let Some(flag) = word.strip_prefix('-') else {
            prompt_parts.push(word);
            continue;
        };

        match flag {
            "edit" => force_edit = true,
            "n" => {
                let value = words
                    .next_if(|next| !next.starts_with('-'))
                    .ok_or_else(|| ArgsError::MissingValue(flag.to_string()))?;
                candidate_count = value
                    .parse::<u32>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| ArgsError::InvalidValue {
                        flag: flag.to_string(),
                        value: value.to_string(),
                    })?;
            }
            _ => {}
        }
    }

    let prompt = prompt_parts.join(" ");
    if prompt.is_empty() {
        return Err(ArgsError::EmptyPrompt);
    }

    Ok(ImagenArgs {
        prompt,
        candidate_count,
        force_edit,
    })
}

/// Where the images of an edit come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// The attachment of the message the command replies to
    RepliedAttachment,
    /// Attachments the user posts after being asked
    Upload,
}

/// How an `/imagen` command is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagenPlan {
    /// Text-to-image
    Generate,
    /// Image edit
    Edit(ImageSource),
}

/// Decide between generation and edit.
///
/// Replying to a photo or document always means editing it.
#[must_use]
pub const fn plan(args: &ImagenArgs, reply_has_attachment: bool) -> ImagenPlan {
    if reply_has_attachment {
        ImagenPlan::Edit(ImageSource::RepliedAttachment)
    } else if args.force_edit {
        ImagenPlan::Edit(ImageSource::Upload)
    } else {
        ImagenPlan::Generate
    }
}

/// Help shown by `/imagenhelp`, with commands written using `prefix`.
#[must_use]
pub fn help_text(prefix: &str) -> String {
    format!(
        "🤖 Imagen Telegram Bot\n\n\
         Available commands:\n\n\
         {prefix}imagen (args) [prompt]\n\
         \x20 args can be:\n\
         \x20   -edit: toggles edit mode (auto enabled if you reply to an image)\n\
         \x20   -n 1: generate n output images\n\
         {prefix}imagencancel - cancel waiting for images\n\n\
         {prefix}imagenhelp - show this help\n\n\
         For more information see {PROJECT_URL}"
    )
}

/// Project page linked from the help text
pub const PROJECT_URL: &str = "https://github.com/nonoo/imagen-gemini-telegram-bot";

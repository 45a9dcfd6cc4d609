use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use clap::Args;
use palaver_llm::create_provider;
use palaver_session::{
    Collaborators, LaunchParams, Message, Navigator, Role, SubmissionOutcome, TimelineController,
    TimelineUpdate, session_route,
};
use palaver_storage::SessionId;
use snafu::ResultExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use super::open_store;
use super::sessions::parse_session_reference;
use crate::error::{CliResult, ControllerSnafu, ProviderSnafu, ReadImageSnafu, ReadInputSnafu};
use crate::settings::SettingsStore;

const HELP: &str = "\
/stop          interrupt the answer being streamed
/reload        regenerate the last answer
/undo          remove the last message
/model [id]    show or select the model
/image <path>  attach an image to the next message
/history       print the conversation
/quit          leave (as does Ctrl-C at the prompt)";

#[derive(Args, Debug, Default)]
pub struct ChatArgs {
    /// Deep link such as `/c/<id>?q=...&model=...`
    #[arg(long)]
    pub link: Option<String>,
    /// Resume a stored session by id or `/c/<id>` route
    #[arg(long, short)]
    pub session: Option<String>,
    /// Question sent as soon as the session opens
    #[arg(long, short)]
    pub query: Option<String>,
    /// Model for the opening question
    #[arg(long, short)]
    pub model: Option<String>,
}

/// Prints route changes instead of switching views.
#[derive(Default)]
struct ConsoleNavigator {
    current: Mutex<String>,
}

impl ConsoleNavigator {
    fn current(&self) -> String {
        self.current
            .lock()
            .map(|route| route.clone())
            .unwrap_or_default()
    }
}

impl Navigator for ConsoleNavigator {
    fn navigate_replace(&self, path: &str) {
        tracing::debug!(route = path, "navigate");
        if let Ok(mut current) = self.current.lock() {
            *current = path.to_string();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Send(String),
    Stop,
    Reload,
    Undo,
    Model(Option<String>),
    Image(PathBuf),
    History,
    Help,
    Quit,
    Unknown(String),
    Empty,
}

fn parse_repl_command(line: &str) -> ReplCommand {
    let trimmed = line.trim();
    let Some(command) = trimmed.strip_prefix('/') else {
        return if trimmed.is_empty() {
            ReplCommand::Empty
        } else {
            ReplCommand::Send(trimmed.to_string())
        };
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (command, ""),
    };
    match name {
        "stop" => ReplCommand::Stop,
        "reload" | "retry" => ReplCommand::Reload,
        "undo" => ReplCommand::Undo,
        "model" => ReplCommand::Model((!argument.is_empty()).then(|| argument.to_string())),
        "image" if !argument.is_empty() => ReplCommand::Image(PathBuf::from(argument)),
        "history" => ReplCommand::History,
        "help" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        _ => ReplCommand::Unknown(trimmed.to_string()),
    }
}

pub async fn run(settings_store: &SettingsStore, args: ChatArgs) -> CliResult<()> {
    let settings = settings_store.effective();
    let session_id = resolve_session(&args)?;
    let launch = resolve_launch(&args);

    let store = Arc::new(open_store(&settings).await?);
    let provider = create_provider(settings.provider_config()).context(ProviderSnafu)?;
    let navigator = Arc::new(ConsoleNavigator::default());

    let mut controller = TimelineController::mount(
        session_id,
        launch,
        Collaborators {
            store,
            provider,
            navigator: navigator.clone(),
        },
        settings.controller_config(),
    )
    .await
    .context(ControllerSnafu)?;

    println!(
        "session {}  model {}  (/help for commands)",
        session_route(session_id),
        controller.selected_model().unwrap_or("<none>")
    );
    print_transcript(controller.messages());

    if let Err(error) = controller.auto_submit().await {
        eprintln!("{error}");
    }
    if controller.is_streaming()
        && let Some(question) = controller.messages().last()
    {
        println!("you> {}", question.text());
        print!("ai> ");
        flush_stdout();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if controller.is_streaming() {
            tokio::select! {
                update = controller.next_update() => {
                    if let Some(update) = update {
                        render_update(&update, &navigator);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    if controller.stop().await.is_some() {
                        println!("\n[stopped]");
                    }
                }
                line = lines.next_line() => {
                    let line = line.context(ReadInputSnafu { stage: "read-while-streaming" })?;
                    match line.as_deref().map(parse_repl_command) {
                        Some(ReplCommand::Stop) => {
                            if controller.stop().await.is_some() {
                                println!("\n[stopped]");
                            }
                        }
                        Some(_) => eprintln!("\nstill answering; /stop interrupts"),
                        None => {
                            controller.stop().await;
                            break;
                        }
                    }
                }
            }
            continue;
        }

        print!("you> ");
        flush_stdout();
        let Some(line) = read_prompt(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };

        match parse_repl_command(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Send(text) => match controller.submit_turn(text).await {
                Ok(()) => {
                    print!("ai> ");
                    flush_stdout();
                }
                Err(error) => eprintln!("{error}"),
            },
            ReplCommand::Stop => println!("nothing is streaming"),
            ReplCommand::Reload => match controller.reload().await {
                Ok(()) => {
                    print!("ai> ");
                    flush_stdout();
                }
                Err(error) => eprintln!("{error}"),
            },
            ReplCommand::Undo => match controller.remove_latest().await {
                Ok(Some(removed)) => println!("removed {}", describe(&removed)),
                Ok(None) => println!("nothing to remove"),
                Err(error) => eprintln!("{error}"),
            },
            ReplCommand::Model(None) => {
                println!("model {}", controller.selected_model().unwrap_or("<none>"));
            }
            ReplCommand::Model(Some(model)) => controller.select_model(model),
            ReplCommand::Image(path) => match encode_image(&path) {
                Ok(encoded) => {
                    let mut images = controller
                        .pending_attachments()
                        .map(<[String]>::to_vec)
                        .unwrap_or_default();
                    images.push(encoded);
                    println!("{} image(s) attached to the next message", images.len());
                    controller.set_pending_attachments(images);
                }
                Err(error) => eprintln!("{error}"),
            },
            ReplCommand::History => print_transcript(controller.messages()),
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::Quit => break,
            ReplCommand::Unknown(command) => eprintln!("unknown command {command}; /help lists them"),
        }
    }

    Ok(())
}

fn resolve_session(args: &ChatArgs) -> CliResult<SessionId> {
    if let Some(raw) = &args.session {
        return parse_session_reference(raw);
    }

    let linked = args
        .link
        .as_deref()
        .map(|link| link.split('?').next().unwrap_or(link))
        .filter(|path| path.contains("/c/"));
    match linked {
        Some(path) => parse_session_reference(path),
        None => Ok(SessionId::new_v7()),
    }
}

/// Flags override the matching link parameters.
fn resolve_launch(args: &ChatArgs) -> LaunchParams {
    let linked = args
        .link
        .as_deref()
        .map(LaunchParams::from_link)
        .unwrap_or_default();
    LaunchParams::new(
        args.query
            .clone()
            .or_else(|| linked.initial_query().map(str::to_string)),
        args.model
            .clone()
            .or_else(|| linked.initial_model().map(str::to_string)),
    )
}

fn encode_image(path: &Path) -> CliResult<String> {
    let bytes = std::fs::read(path).context(ReadImageSnafu {
        path: path.to_path_buf(),
    })?;
    Ok(format!(
        "data:{};base64,{}",
        image_mime_type(path),
        STANDARD.encode(bytes)
    ))
}

fn image_mime_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/png",
    }
}

fn render_update(update: &TimelineUpdate, navigator: &ConsoleNavigator) {
    match update {
        TimelineUpdate::Chunk(chunk) => {
            print!("{chunk}");
            flush_stdout();
        }
        TimelineUpdate::Settled(SubmissionOutcome::Finished(_)) => {
            println!();
            tracing::debug!(route = %navigator.current(), "answer saved");
        }
        TimelineUpdate::Settled(SubmissionOutcome::Failed(message)) => {
            println!();
            eprintln!("[error] {message}; the conversation was reset to {}", navigator.current());
        }
        TimelineUpdate::Settled(SubmissionOutcome::Stopped) => println!("\n[stopped]"),
    }
}

fn print_transcript(messages: &[Message]) {
    for message in messages {
        println!("{}", describe(message));
    }
}

fn describe(message: &Message) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "ai",
        Role::System => "system",
    };
    let images = match message.attachments.len() {
        0 => String::new(),
        count => format!(" [{count} image(s)]"),
    };
    format!("{speaker}> {}{images}", message.text())
}

fn flush_stdout() {
    let _ = std::io::stdout().flush();
}

/// Next prompt line, or `None` on end of input or once `interrupt` fires.
async fn read_prompt<R>(
    lines: &mut Lines<R>,
    interrupt: impl Future<Output = std::io::Result<()>>,
) -> CliResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        line = lines.next_line() => line.context(ReadInputSnafu { stage: "read-prompt" }),
        _ = interrupt => Ok(None),
    }
}

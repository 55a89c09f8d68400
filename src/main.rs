use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use family_space::backend::RestBackend;
use family_space::config::Config;
use family_space::messages::{Action, Locale, UserMessage};
use family_space::services::{FamilyChoice, ProfileEdit, SignupForm, SignupOutcome};
use family_space::session::{AuthPhase, ReconcileOutcome, SessionState};
use family_space::{AppResult, FamilySpace};

#[derive(Parser)]
#[command(name = "family-space", version, about = "Family space account and profile client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the signed-in user
    Whoami,
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account and either start or join a family
    Signup {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long, conflicts_with = "invite_code")]
        family_name: Option<String>,
        #[arg(long)]
        invite_code: Option<String>,
    },
    Logout,
    /// Re-read the profile from the backend
    Sync,
    /// Join a family by invite code
    Join { code: String },
    CreateFamily {
        name: String,
        /// Use this invite code instead of a generated one
        #[arg(long)]
        code: Option<String>,
    },
    /// Show the current family and its invite code
    Family,
    /// Edit the profile
    Profile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        avatar: Option<String>,
    },
    /// Print every session change until interrupted
    Watch,
}

impl Command {
    fn action(&self) -> Action {
        match self {
            Command::Login { .. } => Action::Login,
            Command::Signup { .. } => Action::Signup,
            Command::Logout => Action::Logout,
            Command::Join { .. } => Action::JoinFamily,
            Command::CreateFamily { .. } => Action::CreateFamily,
            Command::Profile { .. } => Action::SaveProfile,
            Command::Whoami | Command::Sync | Command::Family | Command::Watch => Action::Sync,
        }
    }

    /// Commands that replace or discard the session work without a restored one.
    fn needs_session(&self) -> bool {
        !matches!(
            self,
            Command::Login { .. } | Command::Signup { .. } | Command::Logout
        )
    }
}

/// Long enough for the default retries, recovery and one request timeout.
const SETTLE_LIMIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "family_space=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env().context("BACKEND_URL and BACKEND_ANON_KEY must be set")?;
    let locale = config.locale;

    let backend = Arc::new(RestBackend::from_config(&config)?);
    let app = FamilySpace::new(backend, config.session_settings(), locale);

    let action = cli.command.action();
    let result = match app.start().await {
        Ok(_) => run(&app, cli.command, locale).await,
        Err(e) if !cli.command.needs_session() => {
            tracing::warn!("Session restore failed, continuing with {:?}: {}", action, e);
            run(&app, cli.command, locale).await
        }
        Err(e) => Err(e),
    };
    app.shutdown().await;

    if let Err(e) = result {
        tracing::error!("{:?} failed: {}", action, e);
        eprintln!("{}", UserMessage::for_error(action, &e).render(locale));
        std::process::exit(1);
    }
    Ok(())
}

async fn run(app: &FamilySpace, command: Command, locale: Locale) -> AppResult<()> {
    let say = |message: UserMessage| println!("{}", message.render(locale));

    match command {
        Command::Whoami => {
            app.wait_for_background().await;
            match app.current_user() {
                Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
                None => say(UserMessage::NotSignedIn),
            }
        }
        Command::Login { email, password } => {
            app.auth().login(&email, &password).await?;
            print_settled(app).await?;
        }
        Command::Signup {
            name,
            email,
            password,
            family_name,
            invite_code,
        } => {
            let family = match invite_code {
                Some(code) => FamilyChoice::Join { code },
                None => FamilyChoice::Create { family_name },
            };
            let form = SignupForm {
                name,
                email,
                password,
                family,
            };
            match app.auth().signup(&form).await? {
                SignupOutcome::SignedIn(_) => {
                    say(UserMessage::SignupComplete);
                    print_settled(app).await?;
                }
                SignupOutcome::ConfirmationRequired(_) => say(UserMessage::ConfirmEmail),
            }
        }
        Command::Logout => {
            app.auth().logout().await?;
            say(UserMessage::LoggedOut);
        }
        Command::Sync => {
            app.wait_for_background().await;
            let outcome = app.force_sync().await?;
            tracing::info!("Sync finished: {:?}", outcome);
            let linked = app.current_user().map(|u| u.has_family()).unwrap_or(false);
            match outcome {
                ReconcileOutcome::Degraded { .. } => say(UserMessage::NotLinked),
                _ if !linked => say(UserMessage::NotLinked),
                _ => say(UserMessage::Synced),
            }
        }
        Command::Join { code } => {
            app.wait_for_background().await;
            let family = app.families().join_family(&code).await?;
            say(UserMessage::JoinedFamily { name: family.name });
        }
        Command::CreateFamily { name, code } => {
            app.wait_for_background().await;
            let family = match code {
                Some(code) => app.families().create_family_with_code(&name, &code).await?,
                None => app.families().create_family(&name).await?,
            };
            say(UserMessage::FamilyCreated {
                name: family.name,
                invite_code: family.invite_code.to_string(),
            });
        }
        Command::Family => {
            app.wait_for_background().await;
            match app.families().current_family().await? {
                Some(family) => println!("{} ({})", family.name, family.invite_code),
                None => say(UserMessage::NotLinked),
            }
        }
        Command::Profile {
            name,
            status,
            avatar,
        } => {
            app.wait_for_background().await;
            let edit = ProfileEdit {
                full_name: name,
                status_message: status,
                avatar_url: avatar,
            };
            let user = app.profiles().update_profile(edit).await?;
            say(UserMessage::ProfileSaved);
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Command::Watch => watch(app).await?,
    }
    Ok(())
}

/// Waits for the listener to finish enriching a fresh sign-in, then prints
/// whatever view is current.
async fn print_settled(app: &FamilySpace) -> AppResult<()> {
    let settled = app
        .store()
        .wait_for(SETTLE_LIMIT, |s| s.phase == AuthPhase::AuthenticatedEnriched)
        .await;
    if let Err(e) = settled {
        tracing::warn!("Profile not linked yet: {}", e);
    }
    if let Some(user) = app.current_user() {
        println!("{}", serde_json::to_string_pretty(&user)?);
    }
    Ok(())
}

async fn watch(app: &FamilySpace) -> AppResult<()> {
    let mut changes = WatchStream::new(app.subscribe());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = changes.next() => match next {
                Some(state) => print_state(&state)?,
                None => break,
            },
        }
    }
    Ok(())
}

fn print_state(state: &SessionState) -> AppResult<()> {
    match &state.user {
        Some(user) => println!(
            "[{:?}] {}",
            state.phase,
            serde_json::to_string(user)?
        ),
        None => println!("[{:?}] no user", state.phase),
    }
    Ok(())
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use clinic_session::guard::{GuardDecision, RedirectIntent, RouteGuard};
use clinic_session::notify::{Notifier, TracingNotifier};
use clinic_session::permissions::{self, Feature};
use clinic_session::remote::{OAuth2Callback, OAuth2Handler, OAuth2Provider, PocketBaseClient, RemoteError};
use clinic_session::{
    AuthHelpers, ClientConfig, ConfigError, DataAccessHelpers, ErrorInfo, ListQuery, RecordQuery, SessionStore, User,
};
use serde_json::{Map, Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport setup failed: {0}")]
    Transport(#[from] RemoteError),
    #[error("{0}")]
    Helper(#[from] ErrorInfo),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("expected a JSON object for --data")]
    NotAnObject,
    #[error("session could not be refreshed; signed out")]
    RefreshFailed,
}

#[derive(Parser, Debug)]
#[command(name = "clinic-cli", about = "Clinic session CLI for a PocketBase backend")]
struct Cli {
    #[arg(long, env = "POCKETBASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "POCKETBASE_SESSION_FILE", default_value = ".clinic-session.json")]
    session_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with email and password (superusers first, then users).
    Login {
        email: String,
        #[arg(long, env = "POCKETBASE_PASSWORD", hide_env_values = true)]
        password: String,
        /// Login location carrying `?redirect=`, restored after sign-in.
        #[arg(long)]
        from: Option<String>,
    },
    Logout,
    Whoami,
    Refresh,
    Register(RegisterArgs),
    ResetPassword {
        email: String,
    },
    /// Sign in through an OAuth2 provider configured on the users collection.
    Oauth2 {
        provider: String,
    },
    /// Evaluate a navigation guard for the stored session.
    Guard(GuardArgs),
    Records(RecordsCommand),
}

#[derive(Args, Debug)]
struct RegisterArgs {
    email: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    password_confirm: String,
    #[arg(long)]
    name: Option<String>,
    /// Extra record fields as a JSON object.
    #[arg(long)]
    data: Option<String>,
    /// Sign in after registering.
    #[arg(long, default_value_t = false)]
    login: bool,
}

#[derive(Args, Debug)]
struct GuardArgs {
    path: String,
    #[arg(long = "role")]
    roles: Vec<String>,
    #[arg(long, default_value_t = false, conflicts_with_all = ["roles", "guest"])]
    superuser: bool,
    #[arg(long, default_value_t = false, conflicts_with = "roles")]
    guest: bool,
}

#[derive(Args, Debug)]
struct RecordsCommand {
    #[command(subcommand)]
    command: RecordsSubcommand,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[arg(long)]
    filter: Option<String>,
    #[arg(long)]
    sort: Option<String>,
    #[arg(long)]
    expand: Option<String>,
}

#[derive(Subcommand, Debug)]
enum RecordsSubcommand {
    List {
        collection: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 50)]
        per_page: u32,
        #[command(flatten)]
        list: ListArgs,
    },
    FullList {
        collection: String,
        #[arg(long, default_value_t = 200)]
        batch: u32,
        #[command(flatten)]
        list: ListArgs,
    },
    First {
        collection: String,
        filter: String,
    },
    Get {
        collection: String,
        id: String,
        #[arg(long)]
        expand: Option<String>,
    },
    Create {
        collection: String,
        #[arg(long)]
        data: String,
    },
    Update {
        collection: String,
        id: String,
        #[arg(long)]
        data: String,
    },
    Delete {
        collection: String,
        id: String,
    },
}

struct App {
    store: SessionStore,
    auth: AuthHelpers,
    data: DataAccessHelpers,
    notifier: TracingNotifier,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::from_lookup(|key| match key {
        "POCKETBASE_URL" => cli.base_url.clone(),
        "POCKETBASE_SESSION_FILE" => Some(cli.session_file.display().to_string()),
        _ => std::env::var(key).ok(),
    })?;
    let app = build_app(&config)?;

    let result = run(&app, cli.command).await;
    if let Err(CliError::Helper(err)) = &result {
        app.notifier.report(err);
    }
    result
}

fn build_app(config: &ClientConfig) -> Result<App, CliError> {
    let remote = Arc::new(PocketBaseClient::new(config)?.with_oauth2_handler(Arc::new(StdinOAuth2)));
    tracing::debug!(base_url = remote.base_url(), session_file = ?config.session_file, "client ready");
    let store = SessionStore::from_remote(remote.as_ref());
    let auth = AuthHelpers::new(remote.clone(), store.clone());
    let data = DataAccessHelpers::new(remote);
    Ok(App { store, auth, data, notifier: TracingNotifier })
}

async fn run(app: &App, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login { email, password, from } => {
            let user = app.auth.login(&email, &password).await?;
            let intent = from.as_deref().and_then(RedirectIntent::from_location);
            let next = match &intent {
                Some(intent) => {
                    app.notifier.success(&format!(
                        "Welcome back, {}! Redirecting to {}...",
                        user.display_name(),
                        intent.describe()
                    ));
                    intent.target_path.clone()
                }
                None => {
                    app.notifier.success(&format!("Welcome back, {}!", user.display_name()));
                    RouteGuard::new(app.store.clone()).resolve_after_login()
                }
            };
            print_json(&json!({ "user": user, "next": next }))
        }
        Command::Logout => {
            app.auth.logout();
            app.notifier.info("Signed out.");
            print_json(&session_json(app))
        }
        Command::Whoami => print_json(&session_json(app)),
        Command::Refresh => {
            if app.auth.refresh().await {
                print_json(&session_json(app))
            } else {
                Err(CliError::RefreshFailed)
            }
        }
        Command::Register(args) => run_register(app, args).await,
        Command::ResetPassword { email } => {
            app.auth.request_password_reset(&email).await?;
            app.notifier.success("If the account exists, a reset email is on its way.");
            Ok(())
        }
        Command::Oauth2 { provider } => {
            let user = app.auth.login_with_oauth2(&provider).await?;
            app.notifier.success(&format!("Welcome, {}!", user.display_name()));
            print_json(&json!({ "user": user }))
        }
        Command::Guard(args) => {
            let guard = RouteGuard::new(app.store.clone());
            let decision = if args.guest {
                guard.require_guest()
            } else if args.superuser {
                guard.require_superuser(&args.path)
            } else if args.roles.is_empty() {
                guard.require_authenticated(&args.path)
            } else {
                let roles: Vec<&str> = args.roles.iter().map(String::as_str).collect();
                guard.require_role(&args.path, &roles)
            };
            print_json(&decision_json(&decision))
        }
        Command::Records(records) => run_records(app, records).await,
    }
}

async fn run_register(app: &App, args: RegisterArgs) -> Result<(), CliError> {
    let mut extra = match args.data.as_deref() {
        Some(raw) => parse_object(raw)?,
        None => Map::new(),
    };
    if let Some(name) = args.name {
        extra.insert("name".to_owned(), Value::String(name));
    }

    if !args.login {
        let user = app
            .auth
            .register(&args.email, &args.password, &args.password_confirm, Some(extra))
            .await?;
        app.notifier.success("Account created.");
        return print_json(&json!({ "registered": user }));
    }

    let outcome = app
        .auth
        .register_and_login(&args.email, &args.password, &args.password_confirm, Some(extra))
        .await;
    let user = outcome.registered?;
    app.notifier.success("Account created.");
    match outcome.login {
        Some(Ok(session_user)) => print_json(&json!({ "registered": user, "user": session_user })),
        Some(Err(err)) => {
            app.notifier.warning(&format!("Account created, but sign-in failed: {}", err.message));
            print_json(&json!({ "registered": user, "login_error": err.message }))
        }
        None => print_json(&json!({ "registered": user })),
    }
}

async fn run_records(app: &App, records: RecordsCommand) -> Result<(), CliError> {
    match records.command {
        RecordsSubcommand::List { collection, page, per_page, list } => {
            let query = list_query(list).with_page(page).with_per_page(per_page);
            let page = app.data.get_list::<Value>(&collection, &query).await?;
            print_json(&serde_json::to_value(page)?)
        }
        RecordsSubcommand::FullList { collection, batch, list } => {
            let query = list_query(list).with_per_page(batch);
            let items = app.data.get_full_list::<Value>(&collection, &query).await?;
            print_json(&Value::Array(items))
        }
        RecordsSubcommand::First { collection, filter } => {
            let item = app.data.get_first_list_item::<Value>(&collection, &filter).await?;
            print_json(&item)
        }
        RecordsSubcommand::Get { collection, id, expand } => {
            let query = RecordQuery { expand, ..RecordQuery::default() };
            let item = app.data.get_one_with::<Value>(&collection, &id, &query).await?;
            print_json(&item)
        }
        RecordsSubcommand::Create { collection, data } => {
            let body = Value::Object(parse_object(&data)?);
            let item = app.data.create::<Value, _>(&collection, &body).await?;
            print_json(&item)
        }
        RecordsSubcommand::Update { collection, id, data } => {
            let body = Value::Object(parse_object(&data)?);
            let item = app.data.update::<Value, _>(&collection, &id, &body).await?;
            print_json(&item)
        }
        RecordsSubcommand::Delete { collection, id } => {
            app.data.delete(&collection, &id).await?;
            print_json(&json!({ "deleted": id }))
        }
    }
}

// =============================================================================
// OAUTH2
// =============================================================================

/// Prints the consent URL and reads the redirected URL back from stdin.
struct StdinOAuth2;

#[async_trait::async_trait]
impl OAuth2Handler for StdinOAuth2 {
    async fn authorize(&self, provider: &OAuth2Provider, auth_url: &str) -> Result<OAuth2Callback, RemoteError> {
        let label = if provider.display_name.is_empty() { &provider.name } else { &provider.display_name };
        eprintln!("Open this URL to sign in with {label}:\n\n  {auth_url}\n");
        eprintln!("Then paste the full URL you were redirected to:");

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| RemoteError::OAuth2(format!("failed to read redirect URL: {e}")))?;
        OAuth2Callback::from_redirect_url(&line)
    }
}

// =============================================================================
// OUTPUT
// =============================================================================

fn list_query(args: ListArgs) -> ListQuery {
    ListQuery { filter: args.filter, sort: args.sort, expand: args.expand, ..ListQuery::default() }
}

fn session_json(app: &App) -> Value {
    let session = app.store.current();
    let user = session.valid_user();
    json!({
        "valid": session.is_valid(),
        "superuser": user.is_some_and(permissions::is_superuser),
        "user": user,
        "features": user.map(feature_table),
    })
}

fn feature_table(user: &User) -> Value {
    let table: Map<String, Value> = [Feature::ManageUsers, Feature::ViewReports, Feature::ManageBilling]
        .into_iter()
        .map(|feature| (feature.to_string(), Value::Bool(permissions::can_access(user, feature))))
        .collect();
    Value::Object(table)
}

fn decision_json(decision: &GuardDecision) -> Value {
    match decision {
        GuardDecision::Allow => json!({ "decision": "allow" }),
        GuardDecision::Redirect { to, intent } => json!({
            "decision": "redirect",
            "to": to,
            "intent": intent.as_ref().map(|i| json!({ "target_path": i.target_path, "label": i.describe() })),
        }),
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, CliError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(CliError::NotAnObject),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

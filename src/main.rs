mod client;
mod config;
mod http;
mod metrics;
mod poller;
mod render;
mod resources;
mod snapshot;

use axum::serve;
use clap::{Parser, Subcommand, ValueEnum};
use client::{ClientError, DashboardStatsSource, PanelClient, SystemStatusSource};
use config::{Config, PanelConfig, ViewConfig};
use http::ViewReceivers;
use metrics::Metrics;
use poller::{PollState, Poller, PollerHandle, ViewState};
use snapshot::{DashboardSnapshot, SystemStatus};
use std::io::BufRead;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "panelwatch")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./panelwatch.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Живой дашборд с периодическим обновлением
    Watch {
        #[arg(long, value_enum, default_value_t = WatchView::Dashboard)]
        view: WatchView,
    },
    #[command(flatten)]
    Once(OneShot),
}

#[derive(Subcommand, Debug)]
enum OneShot {
    /// Один снимок дашборда
    Stats,
    /// Один снимок состояния системы
    System,
    Resources,
    Websites {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    Databases {
        #[arg(long, default_value_t = 0)]
        skip: u32,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    Containers,
    Email,
    MailStatus,
    Services,
    RestartService {
        name: String,
    },
    Logs {
        #[arg(long)]
        service: Option<String>,
        #[arg(long, default_value_t = 100)]
        lines: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WatchView {
    Dashboard,
    System,
    All,
}

impl WatchView {
    fn has_dashboard(self) -> bool {
        matches!(self, Self::Dashboard | Self::All)
    }

    fn has_system(self) -> bool {
        matches!(self, Self::System | Self::All)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Credentials {
    Token(String),
    Login { username: String, password: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputCommand {
    Retry,
    Quit,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let client = match connect(&cfg.panel).await {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "не удалось подключиться к панели");
            std::process::exit(1);
        }
    };

    let command = cli.command.unwrap_or(Command::Watch {
        view: WatchView::Dashboard,
    });
    let code = match command {
        Command::Watch { view } => {
            run_watch(cfg, client, view).await;
            0
        }
        Command::Once(command) => match run_once(command, &client, &cfg.view).await {
            Ok(text) => {
                println!("{text}");
                0
            }
            Err(err) => {
                error!(error = %err, "запрос к панели завершился ошибкой");
                1
            }
        },
    };

    if code != 0 {
        std::process::exit(code);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(cfg: &PanelConfig) -> Result<PanelClient, String> {
    let credentials = resolve_credentials(cfg, |name| std::env::var(name).ok())?;
    let client = PanelClient::new(cfg).map_err(|e| e.to_string())?;
    match credentials {
        Credentials::Token(token) => Ok(client.with_token(token)),
        Credentials::Login { username, password } => {
            info!(username = %username, "вход в панель по логину");
            let token = client
                .login(&username, &password)
                .await
                .map_err(|e| e.to_string())?;
            Ok(client.with_token(token))
        }
    }
}

fn resolve_credentials(
    cfg: &PanelConfig,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Credentials, String> {
    let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    if let Some(token) = non_empty(env(cfg.token_env.as_str())) {
        return Ok(Credentials::Token(token));
    }
    if let Some(token) = non_empty(cfg.token.clone()) {
        return Ok(Credentials::Token(token));
    }
    if let Some(username) = non_empty(cfg.username.clone()) {
        return match env(cfg.password_env.as_str()).filter(|p| !p.is_empty()) {
            Some(password) => Ok(Credentials::Login { username, password }),
            None => Err(format!(
                "для входа пользователя '{}' задайте пароль в переменной окружения '{}'",
                username, cfg.password_env
            )),
        };
    }

    Err(format!(
        "не найден токен панели: задайте '{}' в окружении, panel.token или panel.username в config",
        cfg.token_env
    ))
}

async fn run_once(
    command: OneShot,
    client: &PanelClient,
    view: &ViewConfig,
) -> Result<String, ClientError> {
    let now = now_unix();
    let text = match command {
        OneShot::Stats => {
            let mut state = PollState::default();
            state.apply_success(client.dashboard_stats().await?, now);
            render::render_dashboard(&state, view, now)
        }
        OneShot::System => {
            let mut state = PollState::default();
            state.apply_success(client.system_status().await?, now);
            render::render_system(&state, view, now)
        }
        OneShot::Resources => render::render_resources(&client.system_resources().await?),
        OneShot::Websites { skip, limit } => {
            render::render_websites(&client.websites(skip, limit).await?)
        }
        OneShot::Databases { skip, limit } => {
            render::render_databases(&client.databases(skip, limit).await?)
        }
        OneShot::Containers => render::render_containers(&client.containers().await?),
        OneShot::Email => render::render_email_accounts(&client.email_accounts().await?),
        OneShot::MailStatus => render::render_mail_status(&client.mail_server_status().await?),
        OneShot::Services => render::render_services(&client.services().await?),
        OneShot::RestartService { name } => {
            let message = client.restart_service(&name).await?;
            info!(service = %name, "сервис перезапущен");
            let services = client.services().await?;
            format!("{message}\n\n{}", render::render_services(&services))
        }
        OneShot::Logs { service, lines } => {
            render::render_logs(&client.system_logs(service.as_deref(), lines).await?)
        }
    };
    Ok(text)
}

async fn run_watch(cfg: Config, client: PanelClient, view: WatchView) {
    info!(
        base_url = %cfg.panel.base_url,
        view = ?view,
        "запуск panelwatch"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let mut handles: Vec<PollerHandle> = Vec::new();
    let mut views = ViewReceivers::default();

    if view.has_dashboard() {
        let (sink, rx) = ViewState::<DashboardSnapshot>::new();
        let poller = Poller::new(
            DashboardStatsSource::new(client.clone()),
            cfg.polling.dashboard_interval(),
            sink,
        );
        handles.push(poller.mount());
        views.dashboard = Some(rx);
    }
    if view.has_system() {
        let (sink, rx) = ViewState::<SystemStatus>::new();
        let poller = Poller::new(
            SystemStatusSource::new(client.clone()),
            cfg.polling.system_interval(),
            sink,
        );
        handles.push(poller.mount());
        views.system = Some(rx);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = cfg.status_listen.clone().map(|listen| {
        let app = http::build_router(metrics.clone(), views.clone());
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес status_listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };
            info!(listen = %addr, "HTTP статуса запущен");

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    });

    let (input_tx, mut input_rx) = mpsc::unbounded_channel();
    spawn_stdin_reader(input_tx);

    let render_task = {
        let view_cfg = cfg.view.clone();
        let mut views = views.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            redraw(&views, &view_cfg);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    changed = wait_any_change(&mut views) => {
                        if !changed {
                            break;
                        }
                        redraw(&views, &view_cfg);
                    }
                }
            }
        })
    };

    let mut input_open = true;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "не удалось дождаться Ctrl+C");
                }
                info!("получен Ctrl+C, выполняется остановка");
                break;
            }
            cmd = input_rx.recv(), if input_open => match cmd {
                Some(InputCommand::Retry) => {
                    for handle in &handles {
                        info!(resource = handle.resource(), "ручной повтор");
                        handle.retry();
                    }
                }
                Some(InputCommand::Quit) => {
                    info!("выход по команде пользователя");
                    break;
                }
                // stdin закрыт: остаемся до Ctrl+C
                None => input_open = false,
            }
        }
    }

    for handle in handles {
        handle.unmount().await;
    }
    let _ = shutdown_tx.send(true);

    let _ = render_task.await;
    if let Some(task) = http_task {
        let _ = task.await;
    }
}

async fn wait_any_change(views: &mut ViewReceivers) -> bool {
    let ViewReceivers { dashboard, system } = views;
    let dashboard = async {
        match dashboard.as_mut() {
            Some(rx) => rx.changed().await.is_ok(),
            None => std::future::pending().await,
        }
    };
    let system = async {
        match system.as_mut() {
            Some(rx) => rx.changed().await.is_ok(),
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        ok = dashboard => ok,
        ok = system => ok,
    }
}

fn redraw(views: &ViewReceivers, view_cfg: &ViewConfig) {
    let now = now_unix();
    let mut screens = Vec::new();
    if let Some(rx) = views.dashboard.as_ref() {
        screens.push(render::render_dashboard(&rx.borrow(), view_cfg, now));
    }
    if let Some(rx) = views.system.as_ref() {
        screens.push(render::render_system(&rx.borrow(), view_cfg, now));
    }
    // очистка экрана и курсор в начало
    print!("\x1b[2J\x1b[H");
    println!("{}\n\n{}", screens.join("\n\n"), render::RETRY_HINT);
}

fn spawn_stdin_reader(tx: mpsc::UnboundedSender<InputCommand>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            match parse_input(&line) {
                Some(cmd) => {
                    if tx.send(cmd).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => warn!(input = %line.trim(), "неизвестная команда"),
            }
        }
    });
}

fn parse_input(line: &str) -> Option<InputCommand> {
    match line.trim().to_lowercase().as_str() {
        "r" | "retry" => Some(InputCommand::Retry),
        "q" | "quit" | "exit" => Some(InputCommand::Quit),
        _ => None,
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

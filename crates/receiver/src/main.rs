//! # AQI Receiver
//!
//! Servidor de ingestão: recebe lotes autenticados dos coletores via HTTP,
//! deriva o AQI e grava as séries temporais em SQLite.
//!
//! ## Uso
//! ```bash
//! aqi_receiver                          # Usa config.toml ao lado do executável
//! aqi_receiver --config /etc/aqi.toml   # Config explícita
//! ```

mod ingest;
mod normalizer;
mod notify;
mod routes;
mod sqlite;
mod store;

use aqi_core::config::{AppConfig, ReceiverConfig};
use clap::Parser;
use ingest::IngestService;
use normalizer::Normalizer;
use notify::CommandNotifier;
use sqlite::SqliteStore;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use store::{StoreError, TimeSeriesStore};
use tracing::{error, info, warn};

/// Quantas consultas de MAC ficam no histórico.
const LOOKUP_HISTORY: usize = 100;

/// Espera entre tentativas de bind.
const BIND_RETRY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "aqi_receiver", about = "Servidor de ingestão de qualidade do ar")]
#[command(version)]
struct Args {
    /// Caminho do config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// Estado compartilhado entre as requisições.
pub struct AppState {
    ingest: IngestService<SqliteStore>,
    store: Arc<SqliteStore>,
    lookups: Mutex<VecDeque<String>>,
}

impl AppState {
    fn new(ingest: IngestService<SqliteStore>, store: Arc<SqliteStore>) -> Self {
        Self {
            ingest,
            store,
            lookups: Mutex::new(VecDeque::with_capacity(LOOKUP_HISTORY)),
        }
    }

    /// Registra uma consulta de MAC, descartando a mais antiga se cheio.
    fn record_lookup(&self, msg: String) {
        let mut lookups = self.lookups.lock().unwrap_or_else(PoisonError::into_inner);
        if lookups.len() >= LOOKUP_HISTORY {
            lookups.pop_front();
        }
        lookups.push_back(format!("{}: {msg}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S")));
    }

    /// Consultas recentes, mais antiga primeiro.
    fn recent_lookups(&self) -> Vec<String> {
        self.lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    // ── Config ──
    let config_path = args.config.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path);

    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    let errors = config.validate_receiver();
    if !errors.is_empty() {
        for e in &errors {
            error!("Config inválida: {e}");
        }
        return ExitCode::FAILURE;
    }
    let cfg = &config.receiver;

    // ── Banco + registro ──
    let state = match build_state(cfg) {
        Ok(state) => state,
        Err(e) => {
            error!("Falha ao preparar o banco {}: {e}", cfg.database_path);
            return ExitCode::FAILURE;
        }
    };

    let app = routes::build_router(state)
        .into_make_service_with_connect_info::<SocketAddr>();

    // ── Listener ──
    let addr = format!("{}:{}", cfg.bind, cfg.port);
    let listener = loop {
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => break listener,
            Err(e) => {
                error!("Erro ao abrir {addr}: {e}. Tentando novamente em 2s...");
                tokio::time::sleep(BIND_RETRY).await;
            }
        }
    };

    println!();
    println!("══════════════════════════════════════════════");
    println!("   🌫  AQI RECEIVER – ATIVO");
    println!("══════════════════════════════════════════════");
    println!("  HTTP:      http://{addr}/data");
    println!("  Banco:     {}", cfg.database_path);
    println!("  Chunk:     {} linhas", cfg.chunk_size);
    println!("  Prazo:     {:.1}s", cfg.insert_deadline_secs);
    println!("══════════════════════════════════════════════");
    println!();

    if let Err(e) = axum::serve(listener, app).await {
        error!("Servidor HTTP terminou: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn build_state(cfg: &ReceiverConfig) -> Result<Arc<AppState>, StoreError> {
    let store = Arc::new(SqliteStore::new(&cfg.database_path)?);
    store.seed(&cfg.datatypes, &cfg.sensors)?;

    let registry = Arc::new(store.load_registry()?);
    info!(
        "{} sensores, {} tipos de dado, {} pontos armazenados",
        registry.sensor_count(),
        registry.datatype_count(),
        store.count_points()?
    );

    let normalizer = Normalizer::new(
        Arc::clone(&store),
        registry,
        cfg.chunk_size,
        Duration::from_secs_f64(cfg.insert_deadline_secs),
    );
    let notifier = CommandNotifier::from_argv(&cfg.notify_command);
    if let Some(n) = &notifier {
        info!("Notificação ativa: {n:?}");
    }

    Ok(Arc::new(AppState::new(
        IngestService::new(normalizer, cfg.password.clone(), notifier),
        store,
    )))
}

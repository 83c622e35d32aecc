//! # AQI Sender
//!
//! Lê o sensor de particulados, acumula as leituras e envia lotes
//! autenticados ao servidor de ingestão a cada intervalo.
//!
//! ## Uso
//! ```bash
//! aqi_sender                              # Usa config.toml ao lado do executável
//! aqi_sender --config /etc/aqi.toml       # Config explícita
//! aqi_sender --synthetic 10 --requests 3  # Envia lotes sintéticos e sai
//! aqi_sender --drain                      # Lê até EOF, envia o que sobrou e sai
//! ```

mod retry_buffer;
mod source;
mod transport;

use aqi_core::config::AppConfig;
use aqi_core::types::{Measurement, SensorIdentity};
use chrono::{TimeDelta, Utc};
use clap::Parser;
use crossbeam_channel::Receiver;
use retry_buffer::{FlushReport, RetryBuffer};
use source::{MeasurementSource, SourceError, open_source};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};
use transport::{BatchSink, HttpTransport};

#[derive(Parser, Debug)]
#[command(name = "aqi_sender", about = "Coletor de qualidade do ar")]
struct Args {
    /// Caminho do config.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Envia lotes sintéticos com N registros em vez de ler o device
    #[arg(long, value_name = "N")]
    synthetic: Option<usize>,

    /// Quantidade de lotes sintéticos
    #[arg(long, default_value_t = 1, requires = "synthetic")]
    requests: usize,

    /// Sai no fim do stream (após um último envio) em vez de reabrir o device
    #[arg(long)]
    drain: bool,

    /// Loga cada leitura
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    // ── Logging ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    // ── Carregar config ──
    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path);

    // Salva config padrão se não existir
    if !config_path.exists() {
        if let Err(e) = config.save(&config_path) {
            warn!("Não foi possível salvar config padrão: {e}");
        }
    }

    let errors = config.validate_sender();
    if !errors.is_empty() {
        for e in &errors {
            error!("Config inválida: {e}");
        }
        return ExitCode::FAILURE;
    }

    let sender_cfg = &config.sender;
    let Some(identity) = sender_cfg.identity() else {
        error!("Sensor sem identidade configurada");
        return ExitCode::FAILURE;
    };

    let transport = match HttpTransport::new(
        &sender_cfg.url,
        &sender_cfg.password,
        Duration::from_secs_f64(sender_cfg.timeout_secs),
    ) {
        Ok(t) => t,
        Err(e) => {
            error!("Falha ao criar cliente HTTP: {e}");
            return ExitCode::FAILURE;
        }
    };

    // ── Banner ──
    println!();
    println!("══════════════════════════════════════════════");
    println!("   🌫  AQI SENDER – ATIVO");
    println!("══════════════════════════════════════════════");
    println!("  Sensor:    {identity}");
    println!("  Destino:   {}", transport.url());
    if args.synthetic.is_none() {
        println!("  Device:    {} ({:?})", sender_cfg.device, sender_cfg.source);
        println!("  Intervalo: {:.1}s", sender_cfg.flush_interval_secs);
    }
    println!("══════════════════════════════════════════════");
    println!();

    if let Some(records) = args.synthetic {
        return send_synthetic(&transport, &identity, records, args.requests);
    }

    // ── Buffer + thread de flush ──
    let buffer = RetryBuffer::new();
    spawn_status_logger(buffer.status_channel());
    let flusher = match buffer.spawn_flusher(
        transport,
        identity,
        Duration::from_secs_f64(sender_cfg.flush_interval_secs),
    ) {
        Ok(handle) => handle,
        Err(e) => {
            error!("Falha ao iniciar thread de flush: {e}");
            return ExitCode::FAILURE;
        }
    };

    let verbose = args.verbose || sender_cfg.verbose;
    let reopen_delay = Duration::from_secs_f64(sender_cfg.reopen_delay_secs);

    // ── Loop de leitura ──
    loop {
        let mut source = match open_source(sender_cfg) {
            Ok(s) => {
                info!("Device {} aberto", sender_cfg.device);
                s
            }
            Err(e) => {
                error!("Erro ao abrir {}: {e}", sender_cfg.device);
                if args.drain {
                    break;
                }
                std::thread::sleep(reopen_delay);
                continue;
            }
        };

        read_until_closed(source.as_mut(), &buffer, verbose);

        if args.drain {
            break;
        }
        warn!(
            "Device {} fechado; reabrindo em {:.1}s",
            sender_cfg.device, sender_cfg.reopen_delay_secs
        );
        std::thread::sleep(reopen_delay);
    }

    info!("Encerrando; {} leituras ainda na fila", buffer.pending());
    flusher.shutdown();
    ExitCode::SUCCESS
}

/// Lê até EOF ou erro de I/O. Erros de uma leitura só são logados.
fn read_until_closed(source: &mut dyn MeasurementSource, buffer: &RetryBuffer, verbose: bool) {
    loop {
        match source.next_measurement() {
            Ok(m) => {
                if verbose {
                    info!("Leitura: {:?}", m.fields);
                }
                buffer.append(m);
            }
            Err(e) if e.is_recoverable() => warn!("{e}"),
            Err(SourceError::EndOfStream) => return,
            Err(e) => {
                error!("{e}");
                return;
            }
        }
    }
}

/// Acompanha os resultados de envio e loga quando a conexão volta.
fn spawn_status_logger(status: Receiver<FlushReport>) {
    let spawned = std::thread::Builder::new()
        .name("flush-status".into())
        .spawn(move || {
            let mut consecutive_failures = 0usize;
            for report in status {
                match report {
                    FlushReport::Sent(_) if consecutive_failures > 0 => {
                        info!("Servidor de volta após {consecutive_failures} falhas");
                        consecutive_failures = 0;
                    }
                    FlushReport::Sent(_) => {}
                    FlushReport::Failed { .. } => consecutive_failures += 1,
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Sem thread de status: {e}");
    }
}

/// Lote de teste: `pm1.0 = i`, `pm2.5 = 100 + i`, `pm10.0 = 1000 + i`,
/// com 0,1 s entre leituras.
fn synthetic_batch(records: usize) -> Vec<Measurement> {
    let start = Utc::now();
    (0..records)
        .map(|i| {
            let v = i as f64;
            Measurement::new(start + TimeDelta::milliseconds(100 * i as i64))
                .with_field("pm1.0", v)
                .with_field("pm2.5", 100.0 + v)
                .with_field("pm10.0", 1000.0 + v)
        })
        .collect()
}

fn send_synthetic(
    transport: &impl BatchSink,
    identity: &SensorIdentity,
    records: usize,
    requests: usize,
) -> ExitCode {
    let mut failed = 0;
    for n in 1..=requests {
        match transport.send(identity, &synthetic_batch(records)) {
            Ok(report) => info!(
                "Lote {n}/{requests}: HTTP {} em {:.3}s",
                report.status,
                report.elapsed.as_secs_f64()
            ),
            Err(e) => {
                error!("Lote {n}/{requests}: {e}");
                failed += 1;
            }
        }
    }
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_batch_follows_value_pattern() {
        let batch = synthetic_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[2].get("pm1.0"), Some(2.0));
        assert_eq!(batch[2].get("pm2.5"), Some(102.0));
        assert_eq!(batch[2].get("pm10.0"), Some(1002.0));
        assert_eq!(batch[1].time - batch[0].time, TimeDelta::milliseconds(100));
    }

    #[test]
    fn read_until_closed_skips_bad_lines_and_stops_at_eof() {
        use source::JsonLinesSource;
        let mut source = JsonLinesSource::new(std::io::Cursor::new(
            "{\"pm2.5\": 1}\nnot json\n{\"pm2.5\": 2}\n",
        ));
        let buffer = RetryBuffer::new();
        read_until_closed(&mut source, &buffer, false);
        assert_eq!(buffer.pending(), 2);
    }
}

//! Notificação "dados novos" via comando externo.
//!
//! Melhor esforço: falhas são logadas e nunca afetam a resposta HTTP.

use std::process::Command;
use tracing::{debug, warn};

/// Marcador substituído pelo nome do sensor em cada argumento.
pub const SENSOR_PLACEHOLDER: &str = "{sensor}";

/// Executa um comando configurado (argv) após cada lote gravado.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    /// `None` quando o argv está vazio (notificação desligada).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// Argumentos com o marcador substituído.
    pub fn render_args(&self, sensor: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace(SENSOR_PLACEHOLDER, sensor))
            .collect()
    }

    /// Roda o comando e espera terminar. Retorna se teve sucesso.
    pub fn notify(&self, sensor: &str) -> bool {
        let output = Command::new(&self.program)
            .args(self.render_args(sensor))
            .output();
        match output {
            Ok(out) if out.status.success() => {
                debug!("Notificação enviada para {sensor}");
                true
            }
            Ok(out) => {
                warn!(
                    "Comando de notificação saiu com {}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                false
            }
            Err(e) => {
                warn!("Falha ao executar {}: {e}", self.program);
                false
            }
        }
    }
}

//! Configuração unificada via TOML.
//!
//! Um único `config.toml` com uma seção para o coletor (`[sender]`) e outra
//! para o servidor de ingestão (`[receiver]`).

use crate::types::SensorIdentity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Origem das medições no coletor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Frames binários do PMS5003 direto da UART
    Pms5003,
    /// Uma linha JSON por leitura (ponte serial via microcontrolador)
    Jsonl,
}

/// Configuração do Sender (coletor na borda).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Id numérico do sensor (legado; usado se `sensor_name` estiver vazio)
    pub sensor_id: Option<i64>,
    /// Nome do sensor, resolvido no servidor
    pub sensor_name: String,
    /// URL do endpoint `/data`
    pub url: String,
    /// Segredo compartilhado com o servidor
    pub password: String,
    /// Device de leitura (UART ou arquivo)
    pub device: String,
    /// Formato do device
    pub source: SourceKind,
    /// Intervalo entre tentativas de envio (segundos)
    pub flush_interval_secs: f64,
    /// Timeout do POST (segundos)
    pub timeout_secs: f64,
    /// Envia também os 12 campos brutos do frame
    pub send_raw_fields: bool,
    /// Espera antes de reabrir o device após EOF/erro (segundos)
    pub reopen_delay_secs: f64,
    /// Loga cada leitura recebida
    pub verbose: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            sensor_id: None,
            sensor_name: String::new(),
            url: "http://127.0.0.1:15000/data".into(),
            password: String::new(),
            device: "/dev/ttyS0".into(),
            source: SourceKind::Pms5003,
            flush_interval_secs: 15.0,
            timeout_secs: 30.0,
            send_raw_fields: false,
            reopen_delay_secs: 2.0,
            verbose: false,
        }
    }
}

impl SenderConfig {
    /// Identidade configurada: nome tem precedência sobre id.
    pub fn identity(&self) -> Option<SensorIdentity> {
        if !self.sensor_name.is_empty() {
            Some(SensorIdentity::Name(self.sensor_name.clone()))
        } else {
            self.sensor_id.map(SensorIdentity::Id)
        }
    }
}

/// Sensor pré-cadastrado na inicialização do servidor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSeed {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macaddr: Option<String>,
}

/// Tipos de dado conhecidos por padrão (PMS5003, Enviro+ e o AQI derivado).
pub fn default_datatypes() -> Vec<String> {
    let mut names: Vec<String> = [
        "pm1.0",
        "pm2.5",
        "pm10.0",
        "aqi2.5",
        "temperature_C",
        "humidity_perc",
        "pressure_hPa",
        "brightness_lux",
        "oxidizing_ohms",
        "reducing_ohms",
        "nh3_ohms",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    names.extend(crate::frame::FIELD_NAMES.iter().map(|s| s.to_string()));
    names
}

/// Configuração do Receiver (servidor de ingestão).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Endereço de bind HTTP
    pub bind: String,
    /// Porta HTTP
    pub port: u16,
    /// Segredo compartilhado com os coletores
    pub password: String,
    /// Caminho do banco SQLite
    pub database_path: String,
    /// Linhas por transação
    pub chunk_size: usize,
    /// Prazo para gravar um lote (segundos); chunks restantes são descartados
    pub insert_deadline_secs: f64,
    /// Comando de notificação "dados novos" (argv; vazio = desligado).
    /// `{sensor}` é substituído pelo nome do sensor.
    pub notify_command: Vec<String>,
    /// Tipos de dado cadastrados na inicialização
    pub datatypes: Vec<String>,
    /// Sensores cadastrados na inicialização
    pub sensors: Vec<SensorSeed>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 15000,
            password: String::new(),
            database_path: "airquality.db".into(),
            chunk_size: 2000,
            insert_deadline_secs: 20.0,
            notify_command: Vec::new(),
            datatypes: default_datatypes(),
            sensors: Vec::new(),
        }
    }
}

/// Configuração raiz do aplicativo (unifica sender e receiver).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(content) => match toml::from_str::<AppConfig>(&content) {
                    Ok(config) => {
                        info!("Configuração carregada de {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        warn!("Erro ao parsear {}: {}", path.display(), e);
                    }
                },
                Err(e) => {
                    warn!("Erro ao ler {}: {}", path.display(), e);
                }
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self).map_err(|e| e.to_string())?;
        std::fs::write(path, content).map_err(|e| e.to_string())?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Valida a seção do sender e retorna lista de erros.
    pub fn validate_sender(&self) -> Vec<String> {
        let s = &self.sender;
        let mut errors = Vec::new();

        match s.sensor_id {
            Some(id) if id <= 0 && s.sensor_name.is_empty() => {
                errors.push(format!("sensor_id deve ser > 0 (recebido {id})"));
            }
            None if s.sensor_name.is_empty() => {
                errors.push("Defina sensor_name ou sensor_id".into());
            }
            _ => {}
        }
        if s.url.is_empty() {
            errors.push("URL do servidor não pode ser vazia".into());
        }
        if s.password.is_empty() {
            errors.push("Senha do sender não pode ser vazia".into());
        }
        if !(0.1..=3600.0).contains(&s.flush_interval_secs) {
            errors.push(format!(
                "Intervalo de envio inválido: {} (0.1–3600.0)",
                s.flush_interval_secs
            ));
        }
        if !(s.timeout_secs.is_finite() && s.timeout_secs > 0.0) {
            errors.push(format!("Timeout inválido: {}", s.timeout_secs));
        }
        if !(s.reopen_delay_secs.is_finite() && s.reopen_delay_secs >= 0.0) {
            errors.push(format!(
                "Espera de reabertura inválida: {}",
                s.reopen_delay_secs
            ));
        }

        errors
    }

    /// Valida a seção do receiver e retorna lista de erros.
    pub fn validate_receiver(&self) -> Vec<String> {
        let r = &self.receiver;
        let mut errors = Vec::new();

        if r.port == 0 {
            errors.push("Porta do receiver não pode ser 0".into());
        }
        if r.password.is_empty() {
            errors.push("Senha do receiver não pode ser vazia".into());
        }
        if r.chunk_size == 0 {
            errors.push("chunk_size deve ser > 0".into());
        }
        if !(r.insert_deadline_secs.is_finite() && r.insert_deadline_secs > 0.0) {
            errors.push(format!(
                "Prazo de gravação inválido: {}",
                r.insert_deadline_secs
            ));
        }
        for sensor in &r.sensors {
            if sensor.name.is_empty() {
                errors.push("Sensor cadastrado sem nome".into());
            }
        }

        errors
    }
}

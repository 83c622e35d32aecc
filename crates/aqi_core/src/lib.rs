//! # AQI Core
//!
//! Crate compartilhada entre o coletor de borda e o servidor de ingestão:
//! decodificação do frame do sensor, protocolo de rede autenticado,
//! conversão PM2.5 → AQI e configuração TOML.
//!
//! ## Módulos
//! - [`frame`] – Frames binários de 32 bytes do PMS5003
//! - [`types`] – Medição, identidade do sensor, conversão de timestamps
//! - [`protocol`] – Payload JSON do endpoint `/data`
//! - [`auth`] – Salt e digest sha256 do segredo compartilhado
//! - [`aqi`] – Tabela EPA com extensão linear acima de 500
//! - [`config`] – Configuração unificada via TOML

pub mod aqi;
pub mod auth;
pub mod config;
pub mod frame;
pub mod protocol;
pub mod types;

// Re-exports convenientes
pub use aqi::convert_aqi;
pub use config::{AppConfig, ReceiverConfig, SenderConfig};
pub use frame::{Frame, FrameDecoder, FrameError};
pub use protocol::{DataMessage, ProtocolError};
pub use types::{Measurement, SensorIdentity};

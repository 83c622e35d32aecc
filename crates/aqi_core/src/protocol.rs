//! Protocolo de rede edge → servidor (JSON sobre HTTPS POST).
//!
//! ```text
//! {
//!   "sensorname" | "sensorid": <string|int>,
//!   "sensordata": [ { "time": <epoch f64>, "<campo>": <número>, ... } ],
//!   "salt": "<20 letras maiúsculas>",
//!   "auth": "<hex sha256(salt || senha)>"
//! }
//! ```
//!
//! Clientes legados mandam `"clowny-cleartext-password"` no lugar de
//! `salt`/`auth`.

use crate::auth::{Credentials, compute_digest};
use crate::types::{Measurement, SensorIdentity, from_epoch_seconds, to_epoch_seconds};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Nome do campo da senha legada em texto puro.
pub const LEGACY_PASSWORD_FIELD: &str = "clowny-cleartext-password";

/// Erros do protocolo de rede.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON inválido: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lote sem registros")]
    EmptyBatch,

    #[error("Timestamp inválido no registro {index}: {value}")]
    InvalidTime { index: usize, value: f64 },
}

/// Um registro como trafega na rede.
///
/// Os campos chegam como JSON cru: valores não numéricos são descartados em
/// [`DataMessage::measurements`] sem derrubar o lote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRecord {
    pub time: f64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl From<&Measurement> for WireRecord {
    fn from(m: &Measurement) -> Self {
        Self {
            time: to_epoch_seconds(m.time),
            fields: m
                .fields
                .iter()
                .map(|(name, v)| (name.clone(), Value::from(*v)))
                .collect(),
        }
    }
}

impl WireRecord {
    /// Campos numéricos do registro, na ordem do mapa.
    fn numeric_fields(&self) -> Vec<(String, f64)> {
        self.fields
            .iter()
            .filter_map(|(name, value)| match value.as_f64() {
                Some(v) => Some((name.clone(), v)),
                None => {
                    debug!("Ignorando campo não numérico {name}: {value}");
                    None
                }
            })
            .collect()
    }
}

/// Mensagem completa do endpoint `/data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensorname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensorid: Option<i64>,
    pub sensordata: Vec<WireRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(
        rename = "clowny-cleartext-password",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cleartext_password: Option<String>,
}

impl DataMessage {
    /// Monta o payload autenticado para um lote.
    pub fn build(
        identity: &SensorIdentity,
        batch: &[Measurement],
        salt: String,
        secret: &[u8],
    ) -> Self {
        let (sensorname, sensorid) = match identity {
            SensorIdentity::Name(name) => (Some(name.clone()), None),
            SensorIdentity::Id(id) => (None, Some(*id)),
        };
        let auth = compute_digest(&salt, secret);
        Self {
            sensorname,
            sensorid,
            sensordata: batch.iter().map(WireRecord::from).collect(),
            salt: Some(salt),
            auth: Some(auth),
            cleartext_password: None,
        }
    }

    /// Serializa para o corpo do POST.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Interpreta o corpo recebido. Lote vazio é rejeitado.
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let msg: DataMessage = serde_json::from_slice(body)?;
        if msg.sensordata.is_empty() {
            return Err(ProtocolError::EmptyBatch);
        }
        Ok(msg)
    }

    /// Credenciais presentes. O esquema salgado tem precedência sobre o legado.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.salt, &self.auth, &self.cleartext_password) {
            (Some(salt), Some(auth), _) => Some(Credentials::Salted {
                salt: salt.clone(),
                auth: auth.clone(),
            }),
            (_, _, Some(password)) => Some(Credentials::Cleartext(password.clone())),
            _ => None,
        }
    }

    /// Identidade declarada: nome primeiro, id numérico como fallback.
    pub fn identity(&self) -> Option<SensorIdentity> {
        match (&self.sensorname, self.sensorid) {
            (Some(name), _) => Some(SensorIdentity::Name(name.clone())),
            (None, Some(id)) => Some(SensorIdentity::Id(id)),
            (None, None) => None,
        }
    }

    /// Converte os registros de volta em medições com timestamp. Campos não
    /// numéricos ficam de fora.
    pub fn measurements(&self) -> Result<Vec<Measurement>, ProtocolError> {
        self.sensordata
            .iter()
            .enumerate()
            .map(|(index, rec)| {
                let time = from_epoch_seconds(rec.time).ok_or(ProtocolError::InvalidTime {
                    index,
                    value: rec.time,
                })?;
                Ok(Measurement {
                    time,
                    fields: rec.numeric_fields(),
                })
            })
            .collect()
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use serde_json::{Value, json};

    const SALT: &str = "ABCDEFGHIJKLMNOPQRST";

    fn sample_batch() -> Vec<Measurement> {
        vec![
            Measurement::new(from_epoch_seconds(1000.0).unwrap()).with_field("pm2.5", 35.0),
            Measurement::new(from_epoch_seconds(1001.5).unwrap()).with_field("pm2.5", 40.0),
        ]
    }

    #[test]
    fn built_payload_has_wire_shape() {
        let msg = DataMessage::build(
            &SensorIdentity::Name("jer-office".into()),
            &sample_batch(),
            SALT.into(),
            b"secret",
        );
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["sensorname"], "jer-office");
        assert!(value.get("sensorid").is_none());
        assert!(value.get(LEGACY_PASSWORD_FIELD).is_none());
        assert_eq!(value["salt"], SALT);
        assert_eq!(value["auth"], compute_digest(SALT, b"secret"));
        assert_eq!(value["sensordata"][0]["time"], 1000.0);
        assert_eq!(value["sensordata"][1]["time"], 1001.5);
        assert_eq!(value["sensordata"][1]["pm2.5"], 40.0);
    }

    #[test]
    fn numeric_identity_goes_in_sensorid() {
        let msg = DataMessage::build(&SensorIdentity::Id(4), &sample_batch(), SALT.into(), b"s");
        let value: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["sensorid"], 4);
        assert!(value.get("sensorname").is_none());
    }

    #[test]
    fn decoded_message_verifies_and_restores_times() {
        let batch = sample_batch();
        let body = DataMessage::build(
            &SensorIdentity::Name("jer-office".into()),
            &batch,
            SALT.into(),
            b"secret",
        )
        .encode()
        .unwrap();

        let msg = DataMessage::decode(&body).unwrap();
        assert!(msg.credentials().unwrap().verify("secret").is_ok());
        assert_eq!(
            msg.identity(),
            Some(SensorIdentity::Name("jer-office".into()))
        );
        let restored = msg.measurements().unwrap();
        assert_eq!(restored, batch);
    }

    #[test]
    fn name_takes_precedence_over_id() {
        let body = json!({
            "sensorname": "porch",
            "sensorid": 9,
            "sensordata": [{"time": 1.0, "pm2.5": 1}],
        });
        let msg = DataMessage::decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(msg.identity(), Some(SensorIdentity::Name("porch".into())));
    }

    #[test]
    fn legacy_cleartext_password_is_recognized() {
        let body = json!({
            "sensorid": 2,
            "sensordata": [{"time": 1.0, "pm2.5": 3}],
            "clowny-cleartext-password": "pw",
        });
        let msg = DataMessage::decode(body.to_string().as_bytes()).unwrap();
        assert_eq!(msg.credentials(), Some(Credentials::Cleartext("pw".into())));
        assert!(matches!(
            msg.credentials().unwrap().verify("nope"),
            Err(AuthError::PasswordMismatch)
        ));
    }

    #[test]
    fn missing_credentials_is_none() {
        let body = json!({ "sensorid": 2, "sensordata": [{"time": 1.0}], "salt": "X" });
        let msg = DataMessage::decode(body.to_string().as_bytes()).unwrap();
        assert!(msg.credentials().is_none());
    }

    #[test]
    fn rejects_malformed_and_empty_bodies() {
        assert!(matches!(
            DataMessage::decode(b"{not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            DataMessage::decode(br#"{"sensorid": 1}"#),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            DataMessage::decode(br#"{"sensorid": 1, "sensordata": []}"#),
            Err(ProtocolError::EmptyBatch)
        ));
    }

    #[test]
    fn non_numeric_fields_are_dropped_not_fatal() {
        let body = json!({
            "sensorid": 1,
            "sensordata": [
                {"time": 1.0, "pm2.5": 35, "firmware": "v2.1"},
                {"time": 2.0, "pm2.5": 36, "firmware": null, "calibrated": true}
            ],
        });
        let msg = DataMessage::decode(body.to_string().as_bytes()).unwrap();
        let records = msg.measurements().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].fields, vec![("pm2.5".to_string(), 35.0)]);
        assert_eq!(records[1].fields, vec![("pm2.5".to_string(), 36.0)]);
    }

    #[test]
    fn record_time_must_be_finite() {
        let msg = DataMessage {
            sensorname: None,
            sensorid: Some(1),
            sensordata: vec![WireRecord {
                time: f64::NAN,
                fields: Map::new(),
            }],
            salt: None,
            auth: None,
            cleartext_password: None,
        };
        assert!(matches!(
            msg.measurements(),
            Err(ProtocolError::InvalidTime { index: 0, .. })
        ));
    }
}

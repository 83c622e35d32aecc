//! Transporte autenticado: lote → POST JSON → sucesso/falha.

use aqi_core::auth::fresh_salt;
use aqi_core::protocol::{DataMessage, ProtocolError};
use aqi_core::types::{Measurement, SensorIdentity, batch_span};
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Falha de envio. Toda falha é tratada como temporária pelo chamador.
#[derive(Debug, thiserror::Error)]
pub enum TransportFailure {
    #[error("Servidor respondeu HTTP {status}")]
    Status { status: u16 },

    #[error("Falha de rede: {0}")]
    Network(String),

    #[error("Falha ao serializar lote: {0}")]
    Encode(#[from] ProtocolError),
}

/// Resultado de um envio aceito pelo servidor.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    pub status: u16,
    pub records: usize,
    pub elapsed: Duration,
}

/// Destino de lotes (HTTP em produção, fakes nos testes).
pub trait BatchSink {
    fn send(
        &self,
        identity: &SensorIdentity,
        batch: &[Measurement],
    ) -> Result<SendReport, TransportFailure>;
}

/// Cliente HTTP com timeout fixo e segredo compartilhado.
pub struct HttpTransport {
    client: Client,
    url: String,
    secret: Vec<u8>,
}

impl HttpTransport {
    pub fn new(url: &str, password: &str, timeout: Duration) -> Result<Self, TransportFailure> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportFailure::Network(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
            secret: password.as_bytes().to_vec(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl BatchSink for HttpTransport {
    fn send(
        &self,
        identity: &SensorIdentity,
        batch: &[Measurement],
    ) -> Result<SendReport, TransportFailure> {
        if let Some((first, last)) = batch_span(batch) {
            info!(
                "{identity}: enviando {} registros de {first} a {last} para {}",
                batch.len(),
                self.url
            );
        }

        // Salt novo a cada requisição
        let body = DataMessage::build(identity, batch, fresh_salt(), &self.secret).encode()?;
        debug!("Payload: {} bytes", body.len());

        let started = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|e| TransportFailure::Network(e.to_string()))?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(TransportFailure::Status { status });
        }

        Ok(SendReport {
            status,
            records: batch.len(),
            elapsed: started.elapsed(),
        })
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use aqi_core::auth::compute_digest;
    use aqi_core::types::from_epoch_seconds;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    /// Servidor HTTP de uma requisição: responde `status` e devolve o corpo.
    fn serve_once(status: &'static str) -> (String, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/data", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            let mut stream = stream;
            write!(
                stream,
                "HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .unwrap();
            body
        });
        (url, handle)
    }

    fn batch() -> Vec<Measurement> {
        vec![
            Measurement::new(from_epoch_seconds(1000.0).unwrap()).with_field("pm2.5", 35.0),
            Measurement::new(from_epoch_seconds(1001.0).unwrap()).with_field("pm2.5", 40.0),
        ]
    }

    #[test]
    fn http_200_is_success_and_payload_is_signed() {
        let (url, server) = serve_once("200 OK");
        let transport = HttpTransport::new(&url, "secret", Duration::from_secs(5)).unwrap();
        let report = transport
            .send(&SensorIdentity::Name("jer-office".into()), &batch())
            .unwrap();
        assert_eq!(report.status, 200);
        assert_eq!(report.records, 2);

        let body = server.join().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let salt = value["salt"].as_str().unwrap();
        assert_eq!(salt.len(), 20);
        assert_eq!(value["auth"], compute_digest(salt, b"secret"));
        assert_eq!(value["sensorname"], "jer-office");
        assert_eq!(value["sensordata"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn non_200_is_failure() {
        let (url, server) = serve_once("403 Forbidden");
        let transport = HttpTransport::new(&url, "secret", Duration::from_secs(5)).unwrap();
        let err = transport.send(&SensorIdentity::Id(1), &batch()).unwrap_err();
        assert!(matches!(err, TransportFailure::Status { status: 403 }));
        server.join().unwrap();
    }

    #[test]
    fn connection_refused_is_failure() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{port}/data");
        let transport = HttpTransport::new(&url, "secret", Duration::from_secs(2)).unwrap();
        let err = transport.send(&SensorIdentity::Id(1), &batch()).unwrap_err();
        assert!(matches!(err, TransportFailure::Network(_)));
    }
}

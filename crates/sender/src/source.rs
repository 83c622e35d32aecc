//! Fontes de medições do coletor.
//!
//! - [`Pms5003Source`] – frames binários direto da UART do sensor
//! - [`JsonLinesSource`] – uma linha JSON por leitura (ponte serial via
//!   microcontrolador)
//!
//! Ambas atribuem o timestamp no momento da leitura.

use aqi_core::config::{SenderConfig, SourceKind};
use aqi_core::frame::{Frame, FrameDecoder, FrameError};
use aqi_core::types::Measurement;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use tracing::debug;

/// Erros de leitura de uma fonte.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Frame inválido: {0}")]
    Frame(FrameError),

    #[error("Linha JSON inválida: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Fim do stream")]
    EndOfStream,

    #[error("Erro de I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for SourceError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::EndOfStream => SourceError::EndOfStream,
            FrameError::Io(io) => SourceError::Io(io),
            other => SourceError::Frame(other),
        }
    }
}

impl SourceError {
    /// Erros que afetam só a leitura atual; o stream continua válido.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SourceError::Frame(_) | SourceError::Json(_))
    }
}

/// Uma fonte de medições bloqueante.
pub trait MeasurementSource {
    /// Bloqueia até a próxima leitura. Ausência de dados não é erro.
    fn next_measurement(&mut self) -> Result<Measurement, SourceError>;
}

// ──────────────────────────────────────────────
// PMS5003
// ──────────────────────────────────────────────

/// Campos "standard" renomeados para os nomes gravados no servidor.
const STANDARD_FIELDS: [(&str, &str); 3] = [
    ("pm1.0_standard", "pm1.0"),
    ("pm2.5_standard", "pm2.5"),
    ("pm10.0_standard", "pm10.0"),
];

/// Converte um frame em medição.
///
/// Sempre envia `pm1.0`, `pm2.5` e `pm10.0`; com `raw` inclui também os 12
/// campos com os nomes do frame.
pub fn frame_to_measurement(frame: &Frame, time: DateTime<Utc>, raw: bool) -> Measurement {
    let mut m = Measurement::new(time);
    for (frame_name, name) in STANDARD_FIELDS {
        if let Some(v) = frame.get(frame_name) {
            m.push(name, f64::from(v));
        }
    }
    if raw {
        for (name, v) in frame.fields() {
            m.push(name, f64::from(v));
        }
    }
    m
}

/// Sensor PMS5003 lido de um stream de bytes.
pub struct Pms5003Source<R> {
    decoder: FrameDecoder<R>,
    send_raw_fields: bool,
}

impl<R: Read> Pms5003Source<R> {
    pub fn new(reader: R, send_raw_fields: bool) -> Self {
        Self {
            decoder: FrameDecoder::new(reader),
            send_raw_fields,
        }
    }
}

impl<R: Read> MeasurementSource for Pms5003Source<R> {
    fn next_measurement(&mut self) -> Result<Measurement, SourceError> {
        let frame = self.decoder.read()?;
        Ok(frame_to_measurement(&frame, Utc::now(), self.send_raw_fields))
    }
}

// ──────────────────────────────────────────────
// JSON por linha
// ──────────────────────────────────────────────

/// Leituras em JSON, uma por linha (`{"pm2.5": 12, "temperature_C": 21.4}`).
///
/// Linhas em branco são ignoradas; valores não numéricos são descartados.
/// Um campo `time` vindo do device é sobrescrito pelo relógio local.
pub struct JsonLinesSource<R> {
    reader: R,
    line: String,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

impl<R: BufRead> MeasurementSource for JsonLinesSource<R> {
    fn next_measurement(&mut self) -> Result<Measurement, SourceError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                return Err(SourceError::EndOfStream);
            }
            let line = self.line.trim();
            if line.is_empty() {
                continue;
            }

            let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)?;
            let mut m = Measurement::now();
            for (name, value) in object {
                if name == "time" {
                    continue;
                }
                match value.as_f64() {
                    Some(v) => m.push(name, v),
                    None => debug!("Ignorando campo não numérico {name}: {value}"),
                }
            }
            return Ok(m);
        }
    }
}

/// Abre o device configurado com o formato configurado.
pub fn open_source(config: &SenderConfig) -> std::io::Result<Box<dyn MeasurementSource>> {
    let file = File::open(&config.device)?;
    let source: Box<dyn MeasurementSource> = match config.source {
        SourceKind::Pms5003 => Box::new(Pms5003Source::new(
            BufReader::new(file),
            config.send_raw_fields,
        )),
        SourceKind::Jsonl => Box::new(JsonLinesSource::new(BufReader::new(file))),
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqi_core::frame::{FIELD_COUNT, encode_frame};
    use std::io::Cursor;

    const SAMPLE: [u16; FIELD_COUNT] = [5, 12, 18, 6, 13, 19, 1020, 301, 58, 6, 2, 1];

    #[test]
    fn pms_frame_maps_standard_fields() {
        let mut source = Pms5003Source::new(Cursor::new(encode_frame(&SAMPLE).to_vec()), false);
        let m = source.next_measurement().unwrap();
        assert_eq!(
            m.fields,
            vec![
                ("pm1.0".to_string(), 5.0),
                ("pm2.5".to_string(), 12.0),
                ("pm10.0".to_string(), 18.0),
            ]
        );
    }

    #[test]
    fn raw_fields_are_appended_when_enabled() {
        let mut source = Pms5003Source::new(Cursor::new(encode_frame(&SAMPLE).to_vec()), true);
        let m = source.next_measurement().unwrap();
        assert_eq!(m.fields.len(), 3 + FIELD_COUNT);
        assert_eq!(m.get("pm2.5_env"), Some(13.0));
        assert_eq!(m.get("particles_10um"), Some(1.0));
    }

    #[test]
    fn corrupted_frame_is_recoverable_and_eof_is_not() {
        let mut bad = encode_frame(&SAMPLE);
        bad[31] ^= 0x10;
        let mut source = Pms5003Source::new(Cursor::new(bad.to_vec()), false);
        let err = source.next_measurement().unwrap_err();
        assert!(err.is_recoverable());
        let err = source.next_measurement().unwrap_err();
        assert!(matches!(err, SourceError::EndOfStream));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn json_lines_skip_blanks_and_non_numeric() {
        let input = "\n{\"pm2.5\": 12, \"label\": \"x\", \"time\": 5}\n\n{\"temperature_C\": 21.5}\n";
        let mut source = JsonLinesSource::new(Cursor::new(input));

        let first = source.next_measurement().unwrap();
        assert_eq!(first.fields, vec![("pm2.5".to_string(), 12.0)]);

        let second = source.next_measurement().unwrap();
        assert_eq!(second.get("temperature_C"), Some(21.5));
        assert!(second.time >= first.time);

        assert!(matches!(
            source.next_measurement(),
            Err(SourceError::EndOfStream)
        ));
    }

    #[test]
    fn bad_json_line_is_recoverable() {
        let mut source = JsonLinesSource::new(Cursor::new("{oops\n{\"pm1.0\": 1}\n"));
        assert!(source.next_measurement().unwrap_err().is_recoverable());
        assert_eq!(source.next_measurement().unwrap().get("pm1.0"), Some(1.0));
    }
}

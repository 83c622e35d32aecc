//! Decodificador de frames do sensor de particulado (PMS5003 e compatíveis).
//!
//! Formato do frame (32 bytes, big-endian):
//!
//! ```text
//! ┌──────┬──────┬────────────┬──────────────────────┬──────────────┬─────────────┐
//! │ 0x42 │ 0x4D │ Tamanho(2) │ 12 campos u16 (24 B) │ Reservado(2) │ Checksum(2) │
//! └──────┴──────┴────────────┴──────────────────────┴──────────────┴─────────────┘
//! ```
//!
//! - Tamanho declarado sempre 28 (bytes após o próprio campo de tamanho)
//! - Checksum = soma dos bytes `[0..30]` módulo 65536

use std::io::{ErrorKind, Read};

/// Tamanho total do frame.
pub const FRAME_LEN: usize = 32;

/// Primeiro byte de sincronia.
pub const SYNC_1: u8 = 0x42;

/// Segundo byte de sincronia.
pub const SYNC_2: u8 = 0x4D;

/// Valor fixo do campo de tamanho.
pub const DECLARED_LEN: u16 = 28;

/// Quantidade de campos de dados no frame.
pub const FIELD_COUNT: usize = 12;

/// Nomes dos campos na ordem em que aparecem no frame.
pub const FIELD_NAMES: [&str; FIELD_COUNT] = [
    "pm1.0_standard",
    "pm2.5_standard",
    "pm10.0_standard",
    "pm1.0_env",
    "pm2.5_env",
    "pm10.0_env",
    "particles_0.3um",
    "particles_0.5um",
    "particles_1.0um",
    "particles_2.5um",
    "particles_5.0um",
    "particles_10um",
];

const CHECKSUM_OFFSET: usize = 30;
const DATA_OFFSET: usize = 4;

/// Erros de leitura/validação de frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Fim do stream antes de completar o frame")]
    EndOfStream,

    #[error("Segundo byte de sincronia inválido: 0x{0:02X} (esperado 0x{SYNC_2:02X})")]
    BadSync(u8),

    #[error("Tamanho de frame inválido: {0} (esperado {DECLARED_LEN})")]
    BadLength(u16),

    #[error("Checksum inválido: recebido 0x{received:04X}, calculado 0x{computed:04X}")]
    BadChecksum { received: u16, computed: u16 },

    #[error("Erro de I/O: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// `true` para frames corrompidos (sync, tamanho, checksum).
    /// O stream continua utilizável; basta ler de novo.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            FrameError::BadSync(_) | FrameError::BadLength(_) | FrameError::BadChecksum { .. }
        )
    }
}

/// Frame decodificado: os 12 campos na ordem declarada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub values: [u16; FIELD_COUNT],
}

impl Frame {
    /// Pares `(nome, valor)` na ordem do frame.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, u16)> + '_ {
        FIELD_NAMES.iter().copied().zip(self.values.iter().copied())
    }

    /// Valor de um campo pelo nome.
    pub fn get(&self, name: &str) -> Option<u16> {
        FIELD_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }
}

/// Soma dos 30 primeiros bytes, módulo 65536.
pub fn frame_checksum(buf: &[u8; FRAME_LEN]) -> u16 {
    buf[..CHECKSUM_OFFSET]
        .iter()
        .fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

fn be_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Valida e decodifica um frame completo.
pub fn decode_frame(buf: &[u8; FRAME_LEN]) -> Result<Frame, FrameError> {
    // O primeiro byte já foi usado para sincronizar, mas o frame pode vir
    // de outra origem (testes, replay).
    if buf[0] != SYNC_1 {
        return Err(FrameError::BadSync(buf[0]));
    }
    if buf[1] != SYNC_2 {
        return Err(FrameError::BadSync(buf[1]));
    }

    let declared = be_u16(buf, 2);
    if declared != DECLARED_LEN {
        return Err(FrameError::BadLength(declared));
    }

    let received = be_u16(buf, CHECKSUM_OFFSET);
    let computed = frame_checksum(buf);
    if received != computed {
        return Err(FrameError::BadChecksum { received, computed });
    }

    let mut values = [0u16; FIELD_COUNT];
    for (i, value) in values.iter_mut().enumerate() {
        *value = be_u16(buf, DATA_OFFSET + i * 2);
    }
    Ok(Frame { values })
}

/// Monta um frame válido com os valores dados (simuladores e testes).
pub fn encode_frame(values: &[u16; FIELD_COUNT]) -> [u8; FRAME_LEN] {
    let mut buf = [0u8; FRAME_LEN];
    buf[0] = SYNC_1;
    buf[1] = SYNC_2;
    buf[2..4].copy_from_slice(&DECLARED_LEN.to_be_bytes());
    for (i, value) in values.iter().enumerate() {
        let at = DATA_OFFSET + i * 2;
        buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
    }
    let checksum = frame_checksum(&buf);
    buf[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_be_bytes());
    buf
}

/// Lê frames de um stream de bytes (UART, arquivo de device, socket).
///
/// Não há limite de ressincronização: bytes são descartados até aparecer
/// `0x42`. Um link que nunca emite `0x42` bloqueia para sempre dentro de
/// `read()` do stream subjacente.
pub struct FrameDecoder<R> {
    reader: R,
    buf: [u8; FRAME_LEN],
    skipped: u64,
}

impl<R: Read> FrameDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: [0u8; FRAME_LEN],
            skipped: 0,
        }
    }

    /// Lê o próximo frame. Falhas não são re-tentadas aqui.
    pub fn read(&mut self) -> Result<Frame, FrameError> {
        self.sync()?;

        match self.reader.read_exact(&mut self.buf[1..]) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(FrameError::EndOfStream),
            Err(e) => return Err(e.into()),
        }

        decode_frame(&self.buf)
    }

    /// Total de bytes descartados procurando o início de frame.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn sync(&mut self) -> Result<(), FrameError> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Err(FrameError::EndOfStream),
                Ok(_) if byte[0] == SYNC_1 => {
                    self.buf[0] = SYNC_1;
                    return Ok(());
                }
                Ok(_) => self.skipped += 1,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAMPLE: [u16; FIELD_COUNT] = [5, 12, 18, 5, 12, 18, 1020, 301, 58, 6, 2, 1];

    #[test]
    fn decodes_valid_frame_in_declared_order() {
        let raw = encode_frame(&SAMPLE);
        let frame = decode_frame(&raw).unwrap();
        assert_eq!(frame.values, SAMPLE);
        assert_eq!(frame.get("pm2.5_standard"), Some(12));
        assert_eq!(frame.get("particles_0.3um"), Some(1020));
        let names: Vec<_> = frame.fields().map(|(n, _)| n).collect();
        assert_eq!(names, FIELD_NAMES);
    }

    #[test]
    fn checksum_is_sum_of_first_30_bytes() {
        let raw = encode_frame(&[u16::MAX; FIELD_COUNT]);
        let expected: u32 = raw[..30].iter().map(|b| u32::from(*b)).sum();
        assert_eq!(u32::from(frame_checksum(&raw)), expected % 65536);
        assert!(decode_frame(&raw).is_ok());
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut raw = encode_frame(&SAMPLE);
        raw[31] ^= 0x01;
        let err = decode_frame(&raw).unwrap_err();
        assert!(matches!(err, FrameError::BadChecksum { .. }));
        assert!(err.is_protocol());
    }

    #[test]
    fn rejects_corrupted_payload() {
        let mut raw = encode_frame(&SAMPLE);
        raw[7] = raw[7].wrapping_add(1);
        assert!(matches!(
            decode_frame(&raw),
            Err(FrameError::BadChecksum { .. })
        ));
    }

    #[test]
    fn rejects_bad_second_sync_byte() {
        let mut raw = encode_frame(&SAMPLE);
        raw[1] = 0x00;
        assert!(matches!(decode_frame(&raw), Err(FrameError::BadSync(0x00))));
    }

    #[test]
    fn rejects_bad_length() {
        let mut raw = encode_frame(&SAMPLE);
        raw[3] = 20;
        assert!(matches!(decode_frame(&raw), Err(FrameError::BadLength(20))));
    }

    #[test]
    fn decoder_skips_leading_garbage() {
        let mut stream = vec![0x00, 0xFF, 0x13, 0x4D];
        stream.extend_from_slice(&encode_frame(&SAMPLE));
        let mut decoder = FrameDecoder::new(Cursor::new(stream));
        let frame = decoder.read().unwrap();
        assert_eq!(frame.values, SAMPLE);
        assert_eq!(decoder.skipped_bytes(), 4);
    }

    #[test]
    fn decoder_reads_consecutive_frames() {
        let mut second = SAMPLE;
        second[1] = 40;
        let mut stream = encode_frame(&SAMPLE).to_vec();
        stream.extend_from_slice(&encode_frame(&second));
        let mut decoder = FrameDecoder::new(Cursor::new(stream));
        assert_eq!(decoder.read().unwrap().values[1], 12);
        assert_eq!(decoder.read().unwrap().values[1], 40);
        assert!(matches!(decoder.read(), Err(FrameError::EndOfStream)));
    }

    #[test]
    fn truncated_frame_is_end_of_stream() {
        let raw = encode_frame(&SAMPLE);
        let mut decoder = FrameDecoder::new(Cursor::new(raw[..20].to_vec()));
        assert!(matches!(decoder.read(), Err(FrameError::EndOfStream)));
    }

    #[test]
    fn bad_frame_does_not_poison_decoder() {
        let mut bad = encode_frame(&SAMPLE);
        bad[30] ^= 0xFF;
        let mut stream = bad.to_vec();
        stream.extend_from_slice(&encode_frame(&SAMPLE));
        let mut decoder = FrameDecoder::new(Cursor::new(stream));
        assert!(decoder.read().unwrap_err().is_protocol());
        assert_eq!(decoder.read().unwrap().values, SAMPLE);
    }
}

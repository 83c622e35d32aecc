//! Buffer de reenvio entre a thread de leitura e o transporte.
//!
//! - `append()` só faz push sob o mutex; nunca toca em rede.
//! - A thread de flush acorda a cada intervalo, move a fila viva para um
//!   lote de trabalho local e tenta enviar **fora** do lock.
//! - Se o envio falha, o lote de trabalho é mantido e reenviado no próximo
//!   ciclo, junto com o que chegou nesse meio tempo (mais antigos primeiro).
//!
//! Entrega é pelo menos uma vez. Não há limite de tamanho: durante uma queda
//! longa do servidor o lote cresce sem parar. O receptor aceita corpos de até
//! 256 MiB (semanas de leituras a 1 Hz); um backlog maior é recusado com 413
//! em todo ciclo e só sai do lugar reiniciando o coletor.

use crate::transport::{BatchSink, SendReport};
use aqi_core::types::{Measurement, SensorIdentity};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Capacidade do canal de status (UI/display). Cheio = relatório descartado.
const STATUS_CHANNEL_CAPACITY: usize = 16;

/// Resultado de um ciclo de flush.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushReport {
    Sent(SendReport),
    Failed { records: usize, reason: String },
}

type Queue = Arc<Mutex<Vec<Measurement>>>;

/// Fila compartilhada entre leitor e thread de flush.
pub struct RetryBuffer {
    queue: Queue,
    status_tx: Sender<FlushReport>,
    status_rx: Receiver<FlushReport>,
}

impl Default for RetryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBuffer {
    pub fn new() -> Self {
        let (status_tx, status_rx) = bounded(STATUS_CHANNEL_CAPACITY);
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            status_tx,
            status_rx,
        }
    }

    /// Enfileira uma medição. Não bloqueia em I/O e não falha.
    pub fn append(&self, record: Measurement) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    /// Medições na fila viva (não inclui o lote em reenvio).
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Canal com o resultado de cada envio, para exibição.
    pub fn status_channel(&self) -> Receiver<FlushReport> {
        self.status_rx.clone()
    }

    /// Cria o executor de flush sem thread (o chamador dirige os ciclos).
    pub fn flusher<S: BatchSink>(&self, sink: S, identity: SensorIdentity) -> Flusher<S> {
        Flusher {
            queue: Arc::clone(&self.queue),
            working: Vec::new(),
            sink,
            identity,
            status_tx: self.status_tx.clone(),
        }
    }

    /// Inicia a thread de flush com o intervalo dado.
    pub fn spawn_flusher<S>(
        &self,
        sink: S,
        identity: SensorIdentity,
        interval: Duration,
    ) -> std::io::Result<FlushHandle>
    where
        S: BatchSink + Send + 'static,
    {
        let flusher = self.flusher(sink, identity);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("retry-flush".into())
            .spawn(move || flusher.run(&stop_rx, interval))?;
        Ok(FlushHandle { stop_tx, thread })
    }
}

/// Executor dos ciclos de flush.
pub struct Flusher<S> {
    queue: Queue,
    /// Lote em reenvio; persiste entre ciclos até um envio dar certo
    working: Vec<Measurement>,
    sink: S,
    identity: SensorIdentity,
    status_tx: Sender<FlushReport>,
}

impl<S: BatchSink> Flusher<S> {
    /// Um ciclo: drena a fila viva e tenta enviar o lote acumulado.
    pub fn tick(&mut self) -> Option<FlushReport> {
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if self.working.is_empty() {
                std::mem::swap(&mut self.working, &mut *queue);
            } else {
                self.working.append(&mut queue);
            }
        }

        if self.working.is_empty() {
            return None;
        }

        let report = match self.sink.send(&self.identity, &self.working) {
            Ok(sent) => {
                info!(
                    "{} registros entregues em {:.2}s",
                    sent.records,
                    sent.elapsed.as_secs_f64()
                );
                self.working.clear();
                FlushReport::Sent(sent)
            }
            Err(e) => {
                warn!(
                    "Envio falhou ({e}); {} registros mantidos para o próximo ciclo",
                    self.working.len()
                );
                FlushReport::Failed {
                    records: self.working.len(),
                    reason: e.to_string(),
                }
            }
        };

        if self.status_tx.try_send(report.clone()).is_err() {
            debug!("Canal de status cheio, descartando relatório");
        }
        Some(report)
    }

    /// Registros aguardando reenvio.
    pub fn backlog(&self) -> usize {
        self.working.len()
    }

    fn run(mut self, stop: &Receiver<()>, interval: Duration) {
        loop {
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    self.tick();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    // Última tentativa antes de sair
                    self.tick();
                    if self.backlog() > 0 {
                        warn!("Encerrando com {} registros não entregues", self.backlog());
                    }
                    return;
                }
            }
        }
    }
}

/// Handle da thread de flush.
pub struct FlushHandle {
    stop_tx: Sender<()>,
    thread: JoinHandle<()>,
}

impl FlushHandle {
    /// Para a thread após uma última tentativa de envio.
    pub fn shutdown(self) {
        let _ = self.stop_tx.try_send(());
        if self.thread.join().is_err() {
            warn!("Thread de flush terminou com panic");
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportFailure;
    use aqi_core::types::from_epoch_seconds;
    use std::collections::VecDeque;

    /// Sink roteirizado: cada chamada consome um resultado (true = sucesso).
    #[derive(Clone, Default)]
    struct ScriptedSink {
        outcomes: Arc<Mutex<VecDeque<bool>>>,
        calls: Arc<Mutex<Vec<(bool, Vec<Measurement>)>>>,
    }

    impl ScriptedSink {
        fn with_outcomes(outcomes: &[bool]) -> Self {
            let sink = Self::default();
            sink.outcomes.lock().unwrap().extend(outcomes);
            sink
        }

        fn delivered(&self) -> Vec<Measurement> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(ok, _)| *ok)
                .flat_map(|(_, batch)| batch.clone())
                .collect()
        }
    }

    impl BatchSink for ScriptedSink {
        fn send(
            &self,
            _identity: &SensorIdentity,
            batch: &[Measurement],
        ) -> Result<SendReport, TransportFailure> {
            let ok = self.outcomes.lock().unwrap().pop_front().unwrap_or(true);
            self.calls.lock().unwrap().push((ok, batch.to_vec()));
            if ok {
                Ok(SendReport {
                    status: 200,
                    records: batch.len(),
                    elapsed: Duration::ZERO,
                })
            } else {
                Err(TransportFailure::Status { status: 503 })
            }
        }
    }

    fn record(i: usize) -> Measurement {
        Measurement::new(from_epoch_seconds(1000.0 + i as f64).unwrap())
            .with_field("pm2.5", i as f64)
    }

    fn identity() -> SensorIdentity {
        SensorIdentity::Name("jer-office".into())
    }

    #[test]
    fn empty_queue_does_not_call_sink() {
        let buffer = RetryBuffer::new();
        let sink = ScriptedSink::default();
        let mut flusher = buffer.flusher(sink.clone(), identity());
        assert!(flusher.tick().is_none());
        assert!(sink.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn success_discards_working_set() {
        let buffer = RetryBuffer::new();
        let sink = ScriptedSink::with_outcomes(&[true]);
        let mut flusher = buffer.flusher(sink.clone(), identity());

        buffer.append(record(0));
        buffer.append(record(1));
        assert_eq!(buffer.pending(), 2);

        assert!(matches!(flusher.tick(), Some(FlushReport::Sent(_))));
        assert_eq!(buffer.pending(), 0);
        assert_eq!(flusher.backlog(), 0);
        assert!(flusher.tick().is_none());
        assert_eq!(sink.delivered(), vec![record(0), record(1)]);
    }

    #[test]
    fn failures_accumulate_without_loss_or_duplication() {
        const FAILED_TICKS: usize = 3;
        let buffer = RetryBuffer::new();
        let sink = ScriptedSink::with_outcomes(&[false; FAILED_TICKS]);
        let mut flusher = buffer.flusher(sink.clone(), identity());

        let mut expected = Vec::new();
        let mut next = 0;
        for _ in 0..FAILED_TICKS {
            for _ in 0..4 {
                buffer.append(record(next));
                expected.push(record(next));
                next += 1;
            }
            let report = flusher.tick().unwrap();
            assert!(matches!(report, FlushReport::Failed { records, .. } if records == next));
            assert_eq!(buffer.pending(), 0);
        }

        buffer.append(record(next));
        expected.push(record(next));

        assert!(matches!(flusher.tick(), Some(FlushReport::Sent(_))));
        assert_eq!(sink.delivered(), expected);
        assert_eq!(flusher.backlog(), 0);

        // Nada é reenviado depois do sucesso
        assert!(flusher.tick().is_none());
        assert_eq!(sink.calls.lock().unwrap().len(), FAILED_TICKS + 1);
    }

    #[test]
    fn status_channel_reports_each_attempt() {
        let buffer = RetryBuffer::new();
        let status = buffer.status_channel();
        let mut flusher = buffer.flusher(ScriptedSink::with_outcomes(&[false, true]), identity());

        buffer.append(record(0));
        flusher.tick();
        flusher.tick();

        assert!(matches!(
            status.try_recv(),
            Ok(FlushReport::Failed { records: 1, .. })
        ));
        assert!(matches!(status.try_recv(), Ok(FlushReport::Sent(r)) if r.records == 1));
        assert!(status.try_recv().is_err());
    }

    #[test]
    fn full_status_channel_does_not_block_flushing() {
        let buffer = RetryBuffer::new();
        let sink = ScriptedSink::default();
        let mut flusher = buffer.flusher(sink.clone(), identity());
        for i in 0..(STATUS_CHANNEL_CAPACITY + 5) {
            buffer.append(record(i));
            assert!(flusher.tick().is_some());
        }
        assert_eq!(sink.delivered().len(), STATUS_CHANNEL_CAPACITY + 5);
    }

    #[test]
    fn flush_thread_delivers_on_shutdown() {
        let buffer = RetryBuffer::new();
        let sink = ScriptedSink::default();
        let handle = buffer
            .spawn_flusher(sink.clone(), identity(), Duration::from_secs(3600))
            .unwrap();

        buffer.append(record(0));
        buffer.append(record(1));
        handle.shutdown();

        assert_eq!(sink.delivered(), vec![record(0), record(1)]);
    }

    #[test]
    fn flush_thread_ticks_on_interval() {
        let buffer = RetryBuffer::new();
        let status = buffer.status_channel();
        let sink = ScriptedSink::default();
        let handle = buffer
            .spawn_flusher(sink.clone(), identity(), Duration::from_millis(10))
            .unwrap();

        buffer.append(record(7));
        let report = status.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(report, FlushReport::Sent(_)));
        handle.shutdown();
        assert_eq!(sink.delivered(), vec![record(7)]);
    }
}

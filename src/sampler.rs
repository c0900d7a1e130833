//! Restartable batch sources.
//!
//! Noise pooling and multi-batch ΔL evaluation draw from the same data stream as
//! training. When the stream runs dry it is restarted, so samples may repeat
//! across an epoch boundary.

use crate::types::InstrumentError;

/// A finite, restartable stream of batches.
pub trait BatchSource {
    type Batch;

    /// Rewind to the start of the stream.
    fn restart(&mut self);

    fn next_batch(&mut self) -> Option<Self::Batch>;
}

/// Infinite view over a [`BatchSource`], restarting it on exhaustion.
pub struct CyclicSampler<S: BatchSource> {
    source: S,
    restarts: usize,
}

impl<S: BatchSource> CyclicSampler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            restarts: 0,
        }
    }

    /// Next batch, wrapping around once if the source is exhausted.
    ///
    /// A source that yields nothing even after a restart is empty and cannot
    /// feed noise estimation.
    pub fn draw(&mut self) -> Result<S::Batch, InstrumentError> {
        if let Some(batch) = self.source.next_batch() {
            return Ok(batch);
        }
        self.source.restart();
        self.restarts += 1;
        log::debug!("batch source exhausted; restart #{}", self.restarts);
        self.source.next_batch().ok_or_else(|| {
            InstrumentError::DegenerateInput("batch source is empty after restart".to_string())
        })
    }

    /// Draws `n` batches in order.
    pub fn draw_many(&mut self, n: usize) -> Result<Vec<S::Batch>, InstrumentError> {
        (0..n).map(|_| self.draw()).collect()
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }
}

/// In-memory batch list, cloned out in order.
#[derive(Debug, Clone)]
pub struct VecSource<B> {
    batches: Vec<B>,
    cursor: usize,
}

impl<B: Clone> VecSource<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self { batches, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl<B: Clone> BatchSource for VecSource<B> {
    type Batch = B;

    fn restart(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Option<B> {
        let batch = self.batches.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(batch)
    }
}

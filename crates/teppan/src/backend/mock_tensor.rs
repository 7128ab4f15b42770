use std::sync::{Arc, Mutex};
use crate::backend::Backend;
use crate::error::{PipelineError, Result};
use crate::interfaces::TokenId;

/// A fake device that keeps an ordered log of what happened on it.
///
/// Mock collaborators push events ("execute", "sample", ...) and every host
/// read pushes `"to_host"`, which lets tests assert when synchronization happens.
#[derive(Clone, Debug, Default)]
pub struct MockDevice {
    events: Arc<Mutex<Vec<String>>>,
}

impl MockDevice {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn host_reads(&self) -> usize {
        self.events().iter().filter(|e| *e == "to_host").count()
    }
}

// A simple host-backed tensor for testing
#[derive(Clone, Debug)]
pub struct MockTensor {
    pub(crate) shape: Vec<usize>,
    pub(crate) data: Vec<f32>,
    pub(crate) device: MockDevice,
}

impl MockTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>, device: &MockDevice) -> Self {
        assert_eq!(shape.iter().product::<usize>(), data.len(), "data does not fit shape {:?}", shape);
        Self { shape, data, device: device.clone() }
    }

    pub fn from_tokens(tokens: &[TokenId], device: &MockDevice) -> Self {
        Self::new(vec![tokens.len()], tokens.iter().map(|t| *t as f32).collect(), device)
    }

    pub fn zeros(shape: Vec<usize>, device: &MockDevice) -> Self {
        let len = shape.iter().product();
        Self::new(shape, vec![0.0; len], device)
    }

    /// Append one column to a `(batch, steps)` buffer without a host read.
    pub fn append_column(&self, column: &[TokenId]) -> Self {
        let (rows, cols) = (self.shape[0], self.shape[1]);
        assert_eq!(rows, column.len());
        let mut data = Vec::with_capacity(rows * (cols + 1));
        for (row, token) in column.iter().enumerate() {
            data.extend_from_slice(&self.data[row * cols..(row + 1) * cols]);
            data.push(*token as f32);
        }
        Self::new(vec![rows, cols + 1], data, &self.device)
    }
}

impl Backend for MockTensor {
    type Device = MockDevice;

    fn shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    fn empty_token_buffer(batch_size: usize, device: &Self::Device) -> Result<Self> {
        Ok(MockTensor::new(vec![batch_size, 0], vec![], device))
    }

    fn from_mask(mask: Vec<u8>, rows: usize, cols: usize, device: &Self::Device) -> Result<Self> {
        if mask.len() != rows * cols {
            return Err(PipelineError::Backend("mask does not fit shape".into()));
        }
        Ok(MockTensor::new(vec![rows, cols], mask.into_iter().map(f32::from).collect(), device))
    }

    fn tokens_to_host(&self) -> Result<Vec<Vec<TokenId>>> {
        self.device.record("to_host");
        if self.shape.len() != 2 {
            return Err(PipelineError::Backend(format!("expected rank 2, got {:?}", self.shape)));
        }
        let cols = self.shape[1];
        Ok((0..self.shape[0])
            .map(|row| self.data[row * cols..(row + 1) * cols].iter().map(|v| *v as TokenId).collect())
            .collect())
    }

    fn to_host_f32(&self) -> Result<Vec<f32>> {
        self.device.record("to_host");
        Ok(self.data.clone())
    }
}

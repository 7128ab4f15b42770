use super::Backend;
use crate::error::{PipelineError, Result};
use crate::interfaces::TokenId;
use candle_core::{DType, Device, Tensor};

impl Backend for Tensor {
    type Device = Device;

    fn shape(&self) -> Vec<usize> {
        self.dims().to_vec()
    }

    fn empty_token_buffer(batch_size: usize, device: &Self::Device) -> Result<Self> {
        Ok(Tensor::zeros((batch_size, 0), DType::I64, device)?)
    }

    fn from_mask(mask: Vec<u8>, rows: usize, cols: usize, device: &Self::Device) -> Result<Self> {
        if mask.len() != rows * cols {
            return Err(PipelineError::Backend(format!(
                "mask of {} entries does not fit shape ({}, {})",
                mask.len(), rows, cols
            )));
        }
        Ok(Tensor::from_vec(mask, (rows, cols), device)?)
    }

    fn tokens_to_host(&self) -> Result<Vec<Vec<TokenId>>> {
        Ok(self.to_dtype(DType::I64)?.to_vec2::<i64>()?)
    }

    fn to_host_f32(&self) -> Result<Vec<f32>> {
        Ok(self.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
    }
}

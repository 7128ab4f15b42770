use crate::backend::Backend;
use crate::error::{PipelineError, Result};
use super::constant::{BATCH_DIM, SEQ_DIM};

/// Check the sampler's newly sampled tokens are a `(batch,)` vector.
///
/// Reads shape metadata only, so it is safe inside the decode loop.
pub(crate) fn expect_sampled_tokens<B>(new_tokens: &B, batch_size: usize) -> Result<()>
where B: Backend
{
    let shape = new_tokens.shape();
    if shape.len() != 1 || shape[BATCH_DIM] != batch_size {
        return Err(PipelineError::invariant(format!(
            "sampler returned next tokens of shape {:?}, expected [{}]",
            shape, batch_size
        )));
    }
    Ok(())
}

/// Check the running generated-token buffer is `(batch, steps)`.
pub(crate) fn expect_generated_tokens<B>(generated: &B, batch_size: usize, steps: usize) -> Result<()>
where B: Backend
{
    let shape = generated.shape();
    if shape.len() != 2 || shape[BATCH_DIM] != batch_size || shape[SEQ_DIM] != steps {
        return Err(PipelineError::invariant(format!(
            "sampler returned generated tokens of shape {:?}, expected [{}, {}]",
            shape, batch_size, steps
        )));
    }
    Ok(())
}

//! Host-side log-probability math for executors implementing
//! [`PipelineModel::compute_log_probabilities`](crate::model::PipelineModel::compute_log_probabilities).
//!
//! An executor copies the logits it needs to the host and hands them over one
//! batch row at a time. Echoing rows cover every prompt position; the others
//! cover only the sampled position.

use std::collections::HashMap;
use crate::error::{PipelineError, Result};
use crate::interfaces::{LogProbabilities, TokenId};

/// Logits and the tokens they were scored against for one batch row.
///
/// `logits[i]` is the vocabulary distribution that produced `samples[i]`.
#[derive(Debug, Clone, Default)]
pub struct RowLogits {
    pub logits: Vec<Vec<f32>>,
    pub samples: Vec<TokenId>,
}

/// Compute per-row log-probabilities.
///
/// # Parameters
///
/// * `get_logits_and_samples` - Called with `(batch_index, echo)` for rows that asked for log-probabilities
/// * `batch_top_n` - Number of alternatives per row; `0` yields `None` for that row
/// * `batch_echo` - Whether each row echoes its prompt
///
/// # Returns
///
/// One entry per row of `batch_top_n`
pub fn compute_log_probabilities<F>(
    mut get_logits_and_samples: F,
    batch_top_n: &[usize],
    batch_echo: &[bool],
) -> Result<Vec<Option<LogProbabilities>>>
where
    F: FnMut(usize, bool) -> Result<RowLogits>,
{
    if batch_top_n.len() != batch_echo.len() {
        return Err(PipelineError::invariant(format!(
            "{} top-n values for {} echo flags",
            batch_top_n.len(),
            batch_echo.len()
        )));
    }

    batch_top_n
        .iter()
        .zip(batch_echo)
        .enumerate()
        .map(|(batch_index, (&top_n, &echo))| {
            if top_n == 0 {
                return Ok(None);
            }
            let row = get_logits_and_samples(batch_index, echo)?;
            log_probabilities_for_row(&row, top_n).map(Some)
        })
        .collect()
}

fn log_probabilities_for_row(row: &RowLogits, top_n: usize) -> Result<LogProbabilities> {
    if row.logits.len() != row.samples.len() {
        return Err(PipelineError::invariant(format!(
            "{} logit rows for {} sampled tokens",
            row.logits.len(),
            row.samples.len()
        )));
    }

    let mut out = LogProbabilities::default();
    for (logits, &sample) in row.logits.iter().zip(&row.samples) {
        let log_probs = log_softmax(logits);
        let sampled = usize::try_from(sample)
            .ok()
            .and_then(|idx| log_probs.get(idx).copied())
            .ok_or_else(|| {
                PipelineError::invariant(format!("sampled token {} outside vocabulary of {}", sample, logits.len()))
            })?;

        let mut ranked: Vec<usize> = (0..log_probs.len()).collect();
        ranked.sort_by(|a, b| log_probs[*b].total_cmp(&log_probs[*a]));

        let mut top: HashMap<TokenId, f32> = ranked
            .into_iter()
            .take(top_n)
            .map(|idx| (idx as TokenId, log_probs[idx]))
            .collect();
        // The sampled token is always reported, even outside the top-n.
        top.insert(sample, sampled);

        out.token_log_probabilities.push(sampled);
        out.top_log_probabilities.push(top);
    }
    Ok(out)
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|l| (l - max).exp()).sum::<f32>().ln() + max;
    logits.iter().map(|l| l - log_sum).collect()
}

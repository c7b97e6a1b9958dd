// Fused CG update: r -= alpha Ap together with the local r.r, then
// x += alpha p queued behind the async copy of the reduced scalar.

use super::{ConjugateGradient, ReductionMode};
use matfree_core::{CopyMode, DeviceVector, Result};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on the number of reduction blocks, and the target block size.
pub const CG_BLOCKSIZE: usize = 1024;

/// Number of blocks for `n` entries: one per `CG_BLOCKSIZE` entries, capped
/// at `CG_BLOCKSIZE`. Past the cap blocks grow instead of multiplying.
pub fn block_count(n: usize) -> usize {
    n.div_ceil(CG_BLOCKSIZE).min(CG_BLOCKSIZE)
}

/// Entries handled by each block.
pub fn block_len(n: usize) -> usize {
    match block_count(n) {
        0 => 0,
        blocks => n.div_ceil(blocks),
    }
}

fn atomic_add(target: &AtomicU64, value: f64) {
    // The closure always returns Some, so this cannot fail.
    let _ = target.fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
        Some((f64::from_bits(bits) + value).to_bits())
    });
}

/// `r -= alpha * ap` and `acc += r.r`, each block adding its partial sum
/// to `acc` atomically.
pub(crate) fn update_r_atomic(
    pool: &rayon::ThreadPool,
    alpha: f64,
    ap: &[f64],
    r: &mut [f64],
    acc: &mut f64,
) {
    let chunk = block_len(r.len());
    if chunk == 0 {
        return;
    }
    let total = AtomicU64::new(acc.to_bits());
    pool.install(|| {
        r.par_chunks_mut(chunk)
            .zip(ap.par_chunks(chunk))
            .for_each(|(r_block, ap_block)| {
                let mut partial = 0.0;
                for (ri, api) in r_block.iter_mut().zip(ap_block) {
                    *ri -= alpha * api;
                    partial += *ri * *ri;
                }
                atomic_add(&total, partial);
            })
    });
    *acc = f64::from_bits(total.into_inner());
}

/// `r -= alpha * ap`, writing block `b`'s part of `r.r` to `partials[b]`.
/// Slots past the last block are zeroed.
pub(crate) fn update_r_partials(
    pool: &rayon::ThreadPool,
    alpha: f64,
    ap: &[f64],
    r: &mut [f64],
    partials: &mut [f64],
) {
    partials.fill(0.0);
    let chunk = block_len(r.len());
    if chunk == 0 {
        return;
    }
    pool.install(|| {
        r.par_chunks_mut(chunk)
            .zip(ap.par_chunks(chunk))
            .zip(partials.par_iter_mut())
            .for_each(|((r_block, ap_block), partial)| {
                *partial = r_block
                    .iter_mut()
                    .zip(ap_block)
                    .map(|(ri, api)| {
                        *ri -= alpha * api;
                        *ri * *ri
                    })
                    .sum();
            })
    });
}

impl ConjugateGradient {
    /// Performs `r -= alpha Ap`, `x += alpha p` and returns the global `r.r`.
    ///
    /// The residual update and its local norm run as one kernel. The copy of
    /// the local norm to the host is queued before the update of `x`, so the
    /// transfer overlaps with it; both are joined before the cross-rank sum.
    pub async fn update_cg(
        &mut self,
        alpha: f64,
        x: &mut DeviceVector,
        r: &mut DeviceVector,
    ) -> Result<f64> {
        let n = self.n;
        let device = &self.device;

        device.fill(1, 0.0, &mut self.rdotr_device)?;

        let ap = self.ap.bind_range(0..n)?;
        let r_binding = r.bind_range(0..n)?;
        let acc = self.rdotr_device.bind();
        match self.mode {
            ReductionMode::Atomic => {
                device.launch("update_cg_r_atomic", move |pool| {
                    let ap = ap.read();
                    let mut r = r_binding.write();
                    let mut acc = acc.write();
                    update_r_atomic(pool, alpha, &ap, &mut r, &mut acc[0]);
                })?;
            }
            ReductionMode::BlockPartials => {
                let partials = self.partials.bind();
                let partials_in = partials.clone();
                device.launch("update_cg_1", move |pool| {
                    let ap = ap.read();
                    let mut r = r_binding.write();
                    let mut partials = partials.write();
                    update_r_partials(pool, alpha, &ap, &mut r, &mut partials);
                })?;
                device.launch("update_cg_2", move |_| {
                    let partials = partials_in.read();
                    acc.write()[0] = partials.iter().sum();
                })?;
            }
        }

        device
            .copy_to_host(&self.rdotr_device.bind(), &self.rdotr_host, CopyMode::Async)
            .await?;
        let transferred = device.tag_stream()?;

        device.axpy(n, alpha, &self.p, 1.0, x)?;
        let updated = device.tag_stream()?;

        futures::try_join!(device.wait_for(transferred), device.wait_for(updated))?;

        let local = self.rdotr_host.value(0)?;
        self.comm.all_reduce_sum(local)
    }
}

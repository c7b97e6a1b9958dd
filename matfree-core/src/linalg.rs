// Dense vector algebra over device vectors.
// Every operation works on the leading `n` entries and is queued on the
// device stream like any other kernel. Reductions are formed per block,
// the block partials are summed in block order, and the local value is then
// summed across ranks through the communicator.

use crate::{
    comm::Communicator,
    device::{ComputeDevice, CopyMode},
    error::Result,
    vector::DeviceVector,
};
use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

/// Entries handled by one block of the reduction kernels.
pub const REDUCTION_BLOCK: usize = 1024;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct AxpyParams {
    a: f64,
    b: f64,
}

impl ComputeDevice {
    /// x[..n] = value
    pub fn fill(&self, n: usize, value: f64, x: &mut DeviceVector) -> Result<()> {
        let out = x.bind_range(0..n)?;
        if out.is_empty() {
            return Ok(());
        }
        self.launch("fill", move |pool| {
            let mut guard = out.write();
            let data: &mut [f64] = &mut guard;
            pool.install(|| {
                data.par_chunks_mut(REDUCTION_BLOCK)
                    .for_each(|block| block.fill(value))
            });
        })
    }

    /// y[..n] = a * x[..n] + b * y[..n]
    pub fn axpy(
        &self,
        n: usize,
        a: f64,
        x: &DeviceVector,
        b: f64,
        y: &mut DeviceVector,
    ) -> Result<()> {
        let params = AxpyParams { a, b };
        let src = x.bind_range(0..n)?;
        let dst = y.bind_range(0..n)?;
        if dst.is_empty() {
            return Ok(());
        }

        self.launch("axpy", move |pool| {
            let x_guard = src.read();
            let mut y_guard = dst.write();
            let x: &[f64] = &x_guard;
            let y: &mut [f64] = &mut y_guard;
            pool.install(|| {
                y.par_chunks_mut(REDUCTION_BLOCK)
                    .zip(x.par_chunks(REDUCTION_BLOCK))
                    .for_each(|(yb, xb)| {
                        for (yi, xi) in yb.iter_mut().zip(xb) {
                            *yi = params.a * xi + params.b * *yi;
                        }
                    })
            });
        })
    }

    /// Global inner product of the leading `n` entries of `x` and `y`.
    pub async fn inner_prod(
        &self,
        n: usize,
        x: &DeviceVector,
        y: &DeviceVector,
        comm: &dyn Communicator,
    ) -> Result<f64> {
        let local = self.local_inner_prod(n, x, y).await?;
        comm.all_reduce_sum(local)
    }

    /// Global Euclidean norm of the leading `n` entries of `x`.
    pub async fn norm2(&self, n: usize, x: &DeviceVector, comm: &dyn Communicator) -> Result<f64> {
        let local = self.local_inner_prod(n, x, x).await?;
        Ok(comm.all_reduce_sum(local)?.sqrt())
    }

    async fn local_inner_prod(&self, n: usize, x: &DeviceVector, y: &DeviceVector) -> Result<f64> {
        let lhs = x.bind_range(0..n)?;
        let rhs = y.bind_range(0..n)?;
        let aliased = x.same_allocation(y);

        let result = self.create_zeroed::<f64>("inner_prod result", 1)?;
        let out = result.bind();
        self.launch("inner_prod", move |pool| {
            let x_guard = lhs.read();
            let x: &[f64] = &x_guard;
            let partials: Vec<f64> = if aliased {
                pool.install(|| {
                    x.par_chunks(REDUCTION_BLOCK)
                        .map(|block| block.iter().map(|v| v * v).sum::<f64>())
                        .collect()
                })
            } else {
                let y_guard = rhs.read();
                let y: &[f64] = &y_guard;
                pool.install(|| {
                    x.par_chunks(REDUCTION_BLOCK)
                        .zip(y.par_chunks(REDUCTION_BLOCK))
                        .map(|(xb, yb)| xb.iter().zip(yb).map(|(a, b)| a * b).sum::<f64>())
                        .collect()
                })
            };
            out.write()[0] = partials.iter().sum();
        })?;

        let staging = self.host_alloc::<f64>("inner_prod staging", 1);
        self.copy_to_host(&result.bind(), &staging, CopyMode::Sync)
            .await?;
        staging.value(0)
    }
}

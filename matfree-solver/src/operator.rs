use matfree_core::{ComputeDevice, CoreError, DeviceVector, Result, Vector};
use rayon::prelude::*;
use std::future::{self, Future};

/// The action of a linear operator on device vectors.
///
/// `apply` may return as soon as the work is queued on the device stream;
/// anything issued afterwards on the same device observes the result.
pub trait Operator {
    fn apply(
        &self,
        q: &DeviceVector,
        aq: &mut DeviceVector,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Plain closures are operators too.
impl<F> Operator for F
where
    F: Fn(&DeviceVector, &mut DeviceVector) -> Result<()>,
{
    fn apply(
        &self,
        q: &DeviceVector,
        aq: &mut DeviceVector,
    ) -> impl Future<Output = Result<()>> + Send {
        future::ready(self(q, aq))
    }
}

/// `Aq = q` on the leading `n` entries.
#[derive(Debug, Clone)]
pub struct IdentityOperator {
    device: ComputeDevice,
    n: usize,
}

impl IdentityOperator {
    pub fn new(device: &ComputeDevice, n: usize) -> Self {
        Self {
            device: device.clone(),
            n,
        }
    }
}

impl Operator for IdentityOperator {
    async fn apply(&self, q: &DeviceVector, aq: &mut DeviceVector) -> Result<()> {
        self.device.axpy(self.n, 1.0, q, 0.0, aq)
    }
}

/// `Aq = diag(d) q`, with `d` resident on the device.
#[derive(Debug)]
pub struct DiagonalOperator {
    device: ComputeDevice,
    diagonal: DeviceVector,
}

impl DiagonalOperator {
    pub fn new(device: &ComputeDevice, diagonal: &[f64]) -> Result<Self> {
        Ok(Self {
            device: device.clone(),
            diagonal: device.create_vector("diagonal", diagonal)?,
        })
    }
}

impl Operator for DiagonalOperator {
    async fn apply(&self, q: &DeviceVector, aq: &mut DeviceVector) -> Result<()> {
        let n = self.diagonal.len();
        if q.len() < n || aq.len() < n {
            return Err(CoreError::InvalidDimensions(format!(
                "Diagonal operator of size {} applied to vectors of length {} and {}",
                n,
                q.len(),
                aq.len()
            )));
        }
        let d = self.diagonal.bind();
        let q = q.bind_range(0..n)?;
        let aq = aq.bind_range(0..n)?;
        self.device.launch("diagonal_apply", move |pool| {
            let d_guard = d.read();
            let q_guard = q.read();
            let mut aq_guard = aq.write();
            let d: &[f64] = &d_guard;
            let q: &[f64] = &q_guard;
            let aq: &mut [f64] = &mut aq_guard;
            pool.install(|| {
                aq.par_iter_mut()
                    .zip(d.par_iter().zip(q.par_iter()))
                    .for_each(|(out, (di, qi))| *out = di * qi)
            });
        })
    }
}

use super::{LinearSolver, ReductionMode, SolveInfo, SolverState};
use crate::operator::Operator;
use matfree_core::{
    Communicator, ComputeDevice, CoreError, DeviceVector, PinnedBuffer, Platform, Result, Vector,
};
use std::sync::Arc;

/// Conjugate Gradient for symmetric positive definite operators.
///
/// Scratch vectors are sized `n + n_halo` and allocated once. Only the first
/// `n` entries take part in the vector algebra and reductions; the halo
/// tail is there for the operator.
#[derive(Debug)]
pub struct ConjugateGradient {
    pub(super) device: ComputeDevice,
    pub(super) comm: Arc<dyn Communicator>,
    pub(super) n: usize,
    pub(super) n_halo: usize,
    pub(super) p: DeviceVector,
    pub(super) ap: DeviceVector,
    /// Device-side accumulator for the fused residual norm.
    pub(super) rdotr_device: DeviceVector,
    /// Per-block partial sums for [`ReductionMode::BlockPartials`].
    pub(super) partials: DeviceVector,
    /// Host-visible landing spot for `rdotr_device`.
    pub(super) rdotr_host: PinnedBuffer<f64>,
    pub(super) mode: ReductionMode,
    state: SolverState,
    last_solve: Option<SolveInfo>,
}

impl ConjugateGradient {
    pub fn new(platform: &Platform, n: usize, n_halo: usize) -> Result<Self> {
        let device = &platform.device;
        let total = n.checked_add(n_halo).ok_or_else(|| {
            CoreError::InvalidDimensions(format!("N ({}) + Nhalo ({}) overflows", n, n_halo))
        })?;
        log::debug!("CG: allocating scratch for N = {}, Nhalo = {}", n, n_halo);

        Ok(Self {
            device: device.clone(),
            comm: Arc::clone(&platform.comm),
            n,
            n_halo,
            p: device.create_empty_vector("cg p", total)?,
            ap: device.create_empty_vector("cg Ap", total)?,
            rdotr_device: device.create_empty_vector("cg rdotr", 1)?,
            partials: device.create_empty_vector("cg rdotr partials", super::update_cg::CG_BLOCKSIZE)?,
            rdotr_host: device.host_alloc("cg rdotr staging", 1),
            mode: ReductionMode::default(),
            state: SolverState::Uninitialized,
            last_solve: None,
        })
    }

    pub fn with_reduction_mode(mut self, mode: ReductionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn reduction_mode(&self) -> ReductionMode {
        self.mode
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn n_halo(&self) -> usize {
        self.n_halo
    }

    pub fn state(&self) -> SolverState {
        self.state
    }

    pub fn last_solve(&self) -> Option<&SolveInfo> {
        self.last_solve.as_ref()
    }

    /// The current search direction `p`.
    pub fn search_direction(&self) -> &DeviceVector {
        &self.p
    }

    /// The operator image `Ap` of the current search direction.
    pub fn operator_image(&self) -> &DeviceVector {
        &self.ap
    }

    fn check_len(&self, name: &str, v: &DeviceVector) -> Result<()> {
        let required = self.n + self.n_halo;
        if v.len() < required {
            return Err(CoreError::InvalidDimensions(format!(
                "CG vector '{}' has length {}, needs at least N + Nhalo = {}",
                name,
                v.len(),
                required
            )));
        }
        Ok(())
    }
}

impl LinearSolver for ConjugateGradient {
    async fn solve<O>(
        &mut self,
        op: &O,
        x: &mut DeviceVector,
        r: &mut DeviceVector,
        tolerance: f64,
        max_iterations: usize,
        verbose: bool,
    ) -> Result<usize>
    where
        O: Operator + Sync,
    {
        self.check_len("x", x)?;
        self.check_len("r", r)?;

        let outcome = self
            .iterate(op, x, r, tolerance, max_iterations, verbose)
            .await;
        if outcome.is_err() {
            self.state = SolverState::Uninitialized;
        }
        outcome
    }
}

impl ConjugateGradient {
    async fn iterate<O>(
        &mut self,
        op: &O,
        x: &mut DeviceVector,
        r: &mut DeviceVector,
        tolerance: f64,
        max_iterations: usize,
        verbose: bool,
    ) -> Result<usize>
    where
        O: Operator + Sync,
    {
        let n = self.n;
        let report = verbose && self.comm.rank() == 0;
        self.state = SolverState::Iterating;

        // r = b - A x
        op.apply(x, &mut self.ap).await?;
        self.device.axpy(n, -1.0, &self.ap, 1.0, r)?;

        let norm = self.device.norm2(n, r, self.comm.as_ref()).await?;
        let mut rdotr = norm * norm;
        let tol = (tolerance * tolerance * rdotr).max(tolerance * tolerance);
        let mut history = vec![rdotr];

        if report {
            log::info!("CG: initial res norm {:.12}", rdotr.sqrt());
        }

        // A previous solve may have left non-finite values in p, and the
        // first update scales p by beta = 0.
        self.device.fill(n, 0.0, &mut self.p)?;

        let mut rdotr_current = 0.0;
        let mut iteration = 0;
        while iteration < max_iterations {
            if rdotr <= tol {
                break;
            }

            let rdotr_previous = rdotr_current;
            rdotr_current = rdotr;
            let beta = if iteration == 0 {
                0.0
            } else {
                rdotr_current / rdotr_previous
            };

            // p = r + beta p
            self.device.axpy(n, 1.0, r, beta, &mut self.p)?;

            op.apply(&self.p, &mut self.ap).await?;

            let p_ap = self
                .device
                .inner_prod(n, &self.p, &self.ap, self.comm.as_ref())
                .await?;
            let alpha = rdotr_current / p_ap;

            // x += alpha p, r -= alpha Ap, rdotr = r.r
            rdotr = self.update_cg(alpha, x, r).await?;
            history.push(rdotr);

            if report {
                if rdotr < 0.0 {
                    log::warn!("CG: rdotr = {:.15}", rdotr);
                }
                log::info!(
                    "CG: it {}, r norm {:.12e}, alpha = {:e}",
                    iteration + 1,
                    rdotr.sqrt(),
                    alpha
                );
            }
            iteration += 1;
        }

        self.state = if rdotr <= tol {
            SolverState::Converged
        } else {
            SolverState::MaxIterExceeded
        };
        log::debug!(
            "CG finished after {} iteration(s) in state {:?}",
            iteration,
            self.state
        );

        self.last_solve = Some(SolveInfo {
            iterations: iteration,
            residual_norm: rdotr.sqrt(),
            state: self.state,
            rdotr_history: history,
        });
        Ok(iteration)
    }
}

use matfree_core::TransferStats;
use matfree_solver::{
    BoxMesh, Communicator, ConjugateGradient, CoreError, LinearSolver, LocalOperator, Platform,
    PlatformConfig, ThreadComm,
};
use std::sync::Arc;
use std::time::Instant;

const ORDER: usize = 4;
const ELEMENTS: [usize; 3] = [8, 4, 4];
const LAMBDA: f64 = 1.0;

/// Right-hand side b[i] = sin(i / n), like a smooth forcing.
fn create_sin_vector(n: usize, total: usize) -> Vec<f64> {
    let mut b: Vec<f64> = (0..n).map(|i| (i as f64 / n as f64).sin()).collect();
    b.resize(total, 0.0);
    b
}

async fn run_rank(comm: ThreadComm, config: PlatformConfig) -> Result<(), CoreError> {
    let comm: Arc<dyn Communicator> = Arc::new(comm);
    let platform = Platform::new(config, comm)?;
    let device = &platform.device;

    let h = [1.0 / ELEMENTS[0] as f64, 1.0 / ELEMENTS[1] as f64, 1.0 / ELEMENTS[2] as f64];
    let mesh = BoxMesh::slab(ORDER, ELEMENTS, h, platform.rank(), platform.size())?;
    let n = mesh.n_local_nodes();
    let n_halo = mesh.n_halo;

    let op = LocalOperator::new(device, &mesh.geometry, mesh.partition.clone(), LAMBDA)?;
    let mut cg = ConjugateGradient::new(&platform, n, n_halo)?;

    let mut x = device.create_empty_vector("x", n + n_halo)?;
    let mut r = device.create_vector("r", &create_sin_vector(n, n + n_halo))?;

    let tolerance = 1e-8;
    let max_iterations = 500;
    if platform.rank() == 0 {
        log::info!("Running matrix-free CG on a {:?} box, order {}", ELEMENTS, ORDER);
        log::info!("  Ranks: {}", platform.size());
        log::info!("  Tolerance: {}", tolerance);
        log::info!("  Max Iterations: {}", max_iterations);
    }

    device.reset_transfer_stats();
    let start_time = Instant::now();
    let iterations = cg
        .solve(&op, &mut x, &mut r, tolerance, max_iterations, true)
        .await?;
    let duration = start_time.elapsed();

    let TransferStats {
        bytes_to_device,
        bytes_from_device,
        kernel_launches,
    } = device.get_transfer_stats();
    log::info!(
        "Rank {}: {} elements, {} iterations in {:?}",
        platform.rank(),
        mesh.n_elements(),
        iterations,
        duration
    );
    log::info!(
        "Rank {}: {} bytes to device, {} bytes from device, {} kernel launches",
        platform.rank(),
        bytes_to_device,
        bytes_from_device,
        kernel_launches
    );
    if let Some(info) = cg.last_solve() {
        log::info!(
            "Rank {}: final residual norm {:.6e} ({:?})",
            platform.rank(),
            info.residual_norm,
            info.state
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    // Initialize logging based on RUST_LOG environment variable
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let ranks = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse::<usize>().ok())
        .unwrap_or(2)
        .max(1);
    let config = match PlatformConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid platform configuration: {}", e);
            return;
        }
    };

    let handles: Vec<_> = ThreadComm::group(ranks)
        .into_iter()
        .map(|comm| {
            let config = config.clone();
            // Collectives block, so every rank gets its own thread.
            tokio::task::spawn_blocking(move || pollster::block_on(run_rank(comm, config)))
        })
        .collect();

    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Solver failed: {:?}", e),
            Err(e) => log::error!("Rank task panicked: {:?}", e),
        }
    }
}

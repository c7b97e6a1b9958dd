use crate::mesh::{
    BatchKind, ElementPartition, MeshGeometry, G00, G01, G02, G11, G12, G22, GEOMETRIC_FACTORS,
    GWJ,
};
use crate::operator::Operator;
use bytemuck::{Pod, Zeroable};
use matfree_core::{Binding, ComputeDevice, CoreError, DeviceBuffer, DeviceVector, Result, Vector};
use rayon::prelude::*;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
struct ElementKernelParams {
    nq: u32,
    np: u32,
    lambda: f64,
}

/// Matrix-free screened Poisson operator, `Aq = D^T G D q + lambda * GWJ * q`,
/// applied element by element on element-local storage.
///
/// The elements are dispatched in three batches (see
/// [`ElementPartition::batches`]) so that a halo exchange started before
/// `apply` can overlap with the halo-independent work queued ahead of the
/// elements that need it. Empty batches are not dispatched.
#[derive(Debug)]
pub struct LocalOperator {
    device: ComputeDevice,
    params: ElementKernelParams,
    n_elements: usize,
    partition: ElementPartition,
    local_ids: DeviceBuffer<u32>,
    global_ids: DeviceBuffer<u32>,
    ggeo: DeviceVector,
    d: DeviceVector,
}

impl LocalOperator {
    pub fn new(
        device: &ComputeDevice,
        geometry: &MeshGeometry,
        partition: ElementPartition,
        lambda: f64,
    ) -> Result<Self> {
        partition.validate(geometry.n_elements)?;
        let reference = &geometry.reference;
        let params = ElementKernelParams {
            nq: reference.nq as u32,
            np: reference.np as u32,
            lambda,
        };
        log::debug!(
            "LocalOperator: {} elements of order {}, {} local / {} global",
            geometry.n_elements,
            reference.order,
            partition.local.len(),
            partition.global.len()
        );

        Ok(Self {
            device: device.clone(),
            params,
            n_elements: geometry.n_elements,
            local_ids: device.create_buffer("local element ids", &partition.local)?,
            global_ids: device.create_buffer("global element ids", &partition.global)?,
            ggeo: device.create_vector("ggeo", &geometry.ggeo)?,
            d: device.create_vector("D", &reference.d)?,
            partition,
        })
    }

    /// Number of element-local node values the operator reads and writes.
    pub fn n_local_nodes(&self) -> usize {
        self.n_elements * self.params.np as usize
    }

    pub fn partition(&self) -> &ElementPartition {
        &self.partition
    }

    fn dispatch(
        &self,
        name: &'static str,
        elements: Binding<u32>,
        q: Binding<f64>,
        aq: Binding<f64>,
    ) -> Result<()> {
        let params = self.params;
        let ggeo = self.ggeo.bind();
        let d = self.d.bind();
        self.device.launch(name, move |pool| {
            let elements = elements.read();
            let ggeo = ggeo.read();
            let d = d.read();
            let q = q.read();
            let mut aq = aq.write();
            element_kernel(pool, params, &elements, &ggeo, &d, &q, &mut aq);
        })
    }
}

impl Operator for LocalOperator {
    async fn apply(&self, q: &DeviceVector, aq: &mut DeviceVector) -> Result<()> {
        let n = self.n_local_nodes();
        if q.len() < n || aq.len() < n {
            return Err(CoreError::InvalidDimensions(format!(
                "LocalOperator needs {} values, got input {} and output {}",
                n,
                q.len(),
                aq.len()
            )));
        }

        for batch in self.partition.batches() {
            if batch.is_empty() {
                continue;
            }
            let range = batch.offset..batch.offset + batch.len();
            let (name, elements) = match batch.kind {
                BatchKind::LocalFirst => ("local_operator_local_first", self.local_ids.bind_range(range)?),
                BatchKind::Global => ("local_operator_global", self.global_ids.bind_range(range)?),
                BatchKind::LocalSecond => ("local_operator_local_second", self.local_ids.bind_range(range)?),
            };
            self.dispatch(name, elements, q.bind_range(0..n)?, aq.bind_range(0..n)?)?;
        }
        Ok(())
    }
}

struct Scratch {
    gr: Vec<f64>,
    gs: Vec<f64>,
    gt: Vec<f64>,
}

fn element_kernel(
    pool: &rayon::ThreadPool,
    params: ElementKernelParams,
    elements: &[u32],
    ggeo: &[f64],
    d: &[f64],
    q: &[f64],
    aq: &mut [f64],
) {
    let np = params.np as usize;
    // Hand each listed element its own output block so blocks can be
    // written in parallel.
    let mut slots: Vec<Option<&mut [f64]>> = aq.chunks_mut(np).map(Some).collect();
    let mut work: Vec<(usize, &mut [f64])> = elements
        .iter()
        .filter_map(|&e| {
            let block = slots.get_mut(e as usize)?.take()?;
            Some((e as usize, block))
        })
        .collect();

    pool.install(|| {
        work.par_iter_mut().for_each_init(
            || Scratch {
                gr: vec![0.0; np],
                gs: vec![0.0; np],
                gt: vec![0.0; np],
            },
            |scratch, (e, out)| apply_element(params, *e, ggeo, d, q, out, scratch),
        )
    });
}

fn apply_element(
    params: ElementKernelParams,
    e: usize,
    ggeo: &[f64],
    d: &[f64],
    q: &[f64],
    out: &mut [f64],
    scratch: &mut Scratch,
) {
    let nq = params.nq as usize;
    let np = params.np as usize;
    let qe = &q[e * np..(e + 1) * np];
    let g = &ggeo[e * GEOMETRIC_FACTORS * np..(e + 1) * GEOMETRIC_FACTORS * np];
    let node = |i: usize, j: usize, k: usize| i + nq * (j + nq * k);

    for k in 0..nq {
        for j in 0..nq {
            for i in 0..nq {
                let mut qr = 0.0;
                let mut qs = 0.0;
                let mut qt = 0.0;
                for m in 0..nq {
                    qr += d[i * nq + m] * qe[node(m, j, k)];
                    qs += d[j * nq + m] * qe[node(i, m, k)];
                    qt += d[k * nq + m] * qe[node(i, j, m)];
                }
                let n = node(i, j, k);
                let (g00, g01, g02) = (g[G00 * np + n], g[G01 * np + n], g[G02 * np + n]);
                let (g11, g12, g22) = (g[G11 * np + n], g[G12 * np + n], g[G22 * np + n]);
                scratch.gr[n] = g00 * qr + g01 * qs + g02 * qt;
                scratch.gs[n] = g01 * qr + g11 * qs + g12 * qt;
                scratch.gt[n] = g02 * qr + g12 * qs + g22 * qt;
            }
        }
    }

    for k in 0..nq {
        for j in 0..nq {
            for i in 0..nq {
                let n = node(i, j, k);
                let mut value = params.lambda * g[GWJ * np + n] * qe[n];
                for m in 0..nq {
                    value += d[m * nq + i] * scratch.gr[node(m, j, k)];
                    value += d[m * nq + j] * scratch.gs[node(i, m, k)];
                    value += d[m * nq + k] * scratch.gt[node(i, j, m)];
                }
                out[n] = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::ReferenceElement;
    use approx::assert_relative_eq;
    use matfree_core::DeviceSettings;
    use pollster::block_on;

    fn device() -> ComputeDevice {
        ComputeDevice::new(DeviceSettings {
            device_id: 0,
            num_threads: 2,
        })
        .unwrap()
    }

    fn geometry(order: usize, n_elements: usize) -> MeshGeometry {
        MeshGeometry::uniform(ReferenceElement::hex(order).unwrap(), n_elements, [1.0, 0.5, 2.0])
    }

    fn random_vector(rng: &mut fastrand::Rng, n: usize) -> Vec<f64> {
        (0..n).map(|_| rng.f64() - 0.5).collect()
    }

    fn dot(a: &[f64], b: &[f64]) -> f64 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    async fn apply_host(op: &LocalOperator, device: &ComputeDevice, q: &[f64], halo: usize) -> Result<Vec<f64>> {
        let q = device.create_vector("q", q)?;
        let mut aq = device.create_empty_vector("aq", op.n_local_nodes() + halo)?;
        op.apply(&q, &mut aq).await?;
        aq.read_contents().await
    }

    #[test]
    fn test_empty_batches_are_not_dispatched() -> Result<()> {
        block_on(async {
            let device = device();
            let cases = [
                (ElementPartition::default(), 0, 0),
                (ElementPartition::all_local(1), 1, 1),
                (ElementPartition::new(vec![], vec![0, 1]), 2, 1),
                (ElementPartition::new(vec![0, 1, 2], vec![3]), 4, 3),
                (ElementPartition::new(vec![0, 1], vec![]), 2, 2),
            ];
            for (partition, n_elements, launches) in cases {
                let op = LocalOperator::new(&device, &geometry(1, n_elements), partition, 1.0)?;
                let q = device.create_empty_vector("q", op.n_local_nodes())?;
                let mut aq = device.create_empty_vector("aq", op.n_local_nodes())?;
                device.finish().await?;

                device.reset_transfer_stats();
                op.apply(&q, &mut aq).await?;
                assert_eq!(device.get_transfer_stats().kernel_launches, launches);
            }
            Ok(())
        })
    }

    #[test]
    fn test_halo_region_is_untouched() -> Result<()> {
        block_on(async {
            let device = device();
            let halo = 5;
            let op = LocalOperator::new(&device, &geometry(2, 3), ElementPartition::new(vec![0, 2], vec![1]), 1.0)?;
            let n = op.n_local_nodes();
            let q = device.create_vector("q", &vec![1.0; n + halo])?;
            let mut aq = device.create_vector("aq", &vec![7.0; n + halo])?;
            op.apply(&q, &mut aq).await?;

            let result = aq.read_contents().await?;
            assert!(result[n..].iter().all(|&v| v == 7.0));
            assert!(result[..n].iter().all(|&v| v != 7.0));
            Ok(())
        })
    }

    #[test]
    fn test_constant_field() -> Result<()> {
        block_on(async {
            let device = device();
            let geometry = geometry(3, 2);
            let partition = ElementPartition::all_local(2);
            let n = geometry.n_local_nodes();

            // The gradient of a constant vanishes, only the mass term remains.
            let laplace = LocalOperator::new(&device, &geometry, partition.clone(), 0.0)?;
            let aq = apply_host(&laplace, &device, &vec![1.0; n], 0).await?;
            assert!(aq.iter().all(|v| v.abs() < 1e-10));

            let helmholtz = LocalOperator::new(&device, &geometry, partition, 1.0)?;
            let aq = apply_host(&helmholtz, &device, &vec![1.0; n], 0).await?;
            // Two elements of volume 1.0 * 0.5 * 2.0.
            assert_relative_eq!(aq.iter().sum::<f64>(), 2.0, max_relative = 1e-12);
            Ok(())
        })
    }

    #[test]
    fn test_symmetric_positive_definite() -> Result<()> {
        block_on(async {
            let device = device();
            let mut rng = fastrand::Rng::with_seed(5);
            let geometry = geometry(4, 3);
            let n = geometry.n_local_nodes();
            let op = LocalOperator::new(&device, &geometry, ElementPartition::new(vec![2, 0], vec![1]), 0.5)?;

            let u = random_vector(&mut rng, n);
            let v = random_vector(&mut rng, n);
            let au = apply_host(&op, &device, &u, 0).await?;
            let av = apply_host(&op, &device, &v, 0).await?;

            assert_relative_eq!(dot(&au, &v), dot(&u, &av), max_relative = 1e-10);
            assert!(dot(&au, &u) > 0.0);
            assert!(dot(&av, &v) > 0.0);
            Ok(())
        })
    }

    #[test]
    fn test_batch_split_does_not_change_result() -> Result<()> {
        block_on(async {
            let device = device();
            let mut rng = fastrand::Rng::with_seed(9);
            let geometry = geometry(2, 5);
            let q = random_vector(&mut rng, geometry.n_local_nodes());

            let all_local = LocalOperator::new(&device, &geometry, ElementPartition::all_local(5), 2.0)?;
            let split = LocalOperator::new(
                &device,
                &geometry,
                ElementPartition::new(vec![4, 1, 3], vec![0, 2]),
                2.0,
            )?;
            assert_eq!(
                apply_host(&all_local, &device, &q, 0).await?,
                apply_host(&split, &device, &q, 0).await?
            );
            Ok(())
        })
    }

    #[test]
    fn test_rejects_bad_partition_and_short_vectors() {
        block_on(async {
            let device = device();
            let geometry = geometry(1, 2);
            assert!(LocalOperator::new(&device, &geometry, ElementPartition::all_local(1), 1.0).is_err());

            let op = LocalOperator::new(&device, &geometry, ElementPartition::all_local(2), 1.0).unwrap();
            let q = device.create_empty_vector("q", 3).unwrap();
            let mut aq = device.create_empty_vector("aq", op.n_local_nodes()).unwrap();
            assert!(matches!(
                op.apply(&q, &mut aq).await,
                Err(CoreError::InvalidDimensions(_))
            ));
        })
    }
}

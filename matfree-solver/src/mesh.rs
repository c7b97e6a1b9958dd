//! Element partitions and geometric data consumed by the local operator.

use crate::reference::ReferenceElement;
use matfree_core::{CoreError, Result};

/// Geometric factors stored per node, in this order.
pub const GEOMETRIC_FACTORS: usize = 7;
pub const G00: usize = 0;
pub const G01: usize = 1;
pub const G02: usize = 2;
pub const G11: usize = 3;
pub const G12: usize = 4;
pub const G22: usize = 5;
pub const GWJ: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    /// Leading half of the halo-independent elements.
    LocalFirst,
    /// Elements that read halo data.
    Global,
    /// Remaining halo-independent elements.
    LocalSecond,
}

/// One dispatch of the element kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementBatch<'a> {
    pub kind: BatchKind,
    /// Position of the first element within its list.
    pub offset: usize,
    pub elements: &'a [u32],
}

impl ElementBatch<'_> {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Element ids split by whether they depend on halo data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementPartition {
    pub local: Vec<u32>,
    pub global: Vec<u32>,
}

impl ElementPartition {
    pub fn new(local: Vec<u32>, global: Vec<u32>) -> Self {
        Self { local, global }
    }

    /// Every element is halo independent.
    pub fn all_local(n_elements: usize) -> Self {
        Self {
            local: (0..n_elements as u32).collect(),
            global: Vec::new(),
        }
    }

    pub fn n_elements(&self) -> usize {
        self.local.len() + self.global.len()
    }

    /// The dispatch order: first half of the local elements, then all the
    /// global elements, then the other `count - count / 2` local elements.
    pub fn batches(&self) -> [ElementBatch<'_>; 3] {
        let half = self.local.len() / 2;
        [
            ElementBatch {
                kind: BatchKind::LocalFirst,
                offset: 0,
                elements: &self.local[..half],
            },
            ElementBatch {
                kind: BatchKind::Global,
                offset: 0,
                elements: &self.global,
            },
            ElementBatch {
                kind: BatchKind::LocalSecond,
                offset: half,
                elements: &self.local[half..],
            },
        ]
    }

    /// Checks that the two lists cover `0..n_elements` exactly once.
    pub fn validate(&self, n_elements: usize) -> Result<()> {
        let mut seen = vec![false; n_elements];
        for &e in self.local.iter().chain(&self.global) {
            let slot = seen.get_mut(e as usize).ok_or_else(|| {
                CoreError::InvalidPartition(format!(
                    "Element {} out of range for a mesh of {} elements",
                    e, n_elements
                ))
            })?;
            if *slot {
                return Err(CoreError::InvalidPartition(format!(
                    "Element {} listed more than once",
                    e
                )));
            }
            *slot = true;
        }
        match seen.iter().position(|covered| !covered) {
            Some(e) => Err(CoreError::InvalidPartition(format!(
                "Element {} is in neither list",
                e
            ))),
            None => Ok(()),
        }
    }
}

/// Per-element data for a hexahedral mesh.
#[derive(Debug, Clone)]
pub struct MeshGeometry {
    pub reference: ReferenceElement,
    pub n_elements: usize,
    /// Factor `g` of node `n` in element `e` is at
    /// `e * GEOMETRIC_FACTORS * np + g * np + n`.
    pub ggeo: Vec<f64>,
}

impl MeshGeometry {
    pub fn new(reference: ReferenceElement, n_elements: usize, ggeo: Vec<f64>) -> Result<Self> {
        let expected = n_elements * GEOMETRIC_FACTORS * reference.np;
        if ggeo.len() != expected {
            return Err(CoreError::InvalidDimensions(format!(
                "Geometric factors have length {}, expected {} for {} elements",
                ggeo.len(),
                expected,
                n_elements
            )));
        }
        Ok(Self {
            reference,
            n_elements,
            ggeo,
        })
    }

    /// Affine elements of size `h`, all identical.
    pub fn uniform(reference: ReferenceElement, n_elements: usize, h: [f64; 3]) -> Self {
        let nq = reference.nq;
        let np = reference.np;
        let w = &reference.gll_weights;
        let jacobian = h[0] * h[1] * h[2] / 8.0;
        let metric = [
            (2.0 / h[0]).powi(2),
            (2.0 / h[1]).powi(2),
            (2.0 / h[2]).powi(2),
        ];

        let mut element = vec![0.0; GEOMETRIC_FACTORS * np];
        for k in 0..nq {
            for j in 0..nq {
                for i in 0..nq {
                    let n = i + nq * (j + nq * k);
                    let wj = w[i] * w[j] * w[k] * jacobian;
                    element[G00 * np + n] = wj * metric[0];
                    element[G11 * np + n] = wj * metric[1];
                    element[G22 * np + n] = wj * metric[2];
                    element[GWJ * np + n] = wj;
                }
            }
        }

        let ggeo = element
            .iter()
            .copied()
            .cycle()
            .take(n_elements * element.len())
            .collect();
        Self {
            reference,
            n_elements,
            ggeo,
        }
    }

    pub fn np(&self) -> usize {
        self.reference.np
    }

    /// Length of the element-local node vector.
    pub fn n_local_nodes(&self) -> usize {
        self.n_elements * self.reference.np
    }
}

/// A structured box of hexahedra split into slabs along `x`, one per rank.
#[derive(Debug, Clone)]
pub struct BoxMesh {
    pub geometry: MeshGeometry,
    pub partition: ElementPartition,
    /// Elements owned by this rank along each axis.
    pub dims: [usize; 3],
    /// First global `x` layer owned by this rank.
    pub x_offset: usize,
    /// Face-node values exchanged with neighbouring ranks.
    pub n_halo: usize,
}

impl BoxMesh {
    /// `elements` is the global element count per axis and `h` the element size.
    pub fn slab(
        order: usize,
        elements: [usize; 3],
        h: [f64; 3],
        rank: usize,
        size: usize,
    ) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(CoreError::InvalidDimensions(format!(
                "Rank {} outside a group of {}",
                rank, size
            )));
        }
        let reference = ReferenceElement::hex(order)?;
        let [nx, ny, nz] = elements;
        let base = nx / size;
        let extra = nx % size;
        let local_nx = base + usize::from(rank < extra);
        let x_offset = rank * base + rank.min(extra);

        let has_left = rank > 0 && local_nx > 0;
        let has_right = x_offset + local_nx < nx && local_nx > 0;

        let mut partition = ElementPartition::default();
        for iz in 0..nz {
            for iy in 0..ny {
                for ix in 0..local_nx {
                    let e = (ix + local_nx * (iy + ny * iz)) as u32;
                    let on_interface = (has_left && ix == 0) || (has_right && ix + 1 == local_nx);
                    if on_interface {
                        partition.global.push(e);
                    } else {
                        partition.local.push(e);
                    }
                }
            }
        }

        // One face of neighbour data per element face on an interface.
        let face_len = |present: bool, side: usize| -> Result<usize> {
            if !present {
                return Ok(0);
            }
            reference
                .face_on(0, side)
                .map(<[usize]>::len)
                .ok_or_else(|| CoreError::InvalidDimensions("Reference hex has no x face".to_string()))
        };
        let n_halo = ny * nz * (face_len(has_left, 0)? + face_len(has_right, 1)?);

        let n_elements = local_nx * ny * nz;
        log::debug!(
            "Rank {}: {} elements ({} local, {} global), halo {}",
            rank,
            n_elements,
            partition.local.len(),
            partition.global.len(),
            n_halo
        );

        Ok(Self {
            geometry: MeshGeometry::uniform(reference, n_elements, h),
            partition,
            dims: [local_nx, ny, nz],
            x_offset,
            n_halo,
        })
    }

    pub fn n_elements(&self) -> usize {
        self.geometry.n_elements
    }

    pub fn n_local_nodes(&self) -> usize {
        self.geometry.n_local_nodes()
    }
}

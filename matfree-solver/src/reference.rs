//! Reference hexahedron: Gauss-Lobatto-Legendre nodes and weights, the 1-D
//! differentiation matrix and the tensor-product node numbering.
//!
//! Volume nodes are numbered `n = i + nq * (j + nq * k)` with `i` running
//! along `r`, `j` along `s` and `k` along `t`.

use matfree_core::{CoreError, Result};
use std::f64::consts::PI;

const NEWTON_MAX_ITERATIONS: usize = 100;

/// Faces of the reference hex, as `(axis, side)` with `side == 0` at `-1`.
pub const HEX_FACES: [(usize, usize); 6] = [(2, 0), (1, 0), (0, 1), (1, 1), (0, 0), (2, 1)];

#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceElement {
    /// Polynomial order.
    pub order: usize,
    /// Nodes per direction, `order + 1`.
    pub nq: usize,
    /// Nodes per element, `nq^3`.
    pub np: usize,
    /// Nodes per face, `nq^2`.
    pub nfp: usize,
    /// GLL nodes on `[-1, 1]`, ascending.
    pub gll_nodes: Vec<f64>,
    pub gll_weights: Vec<f64>,
    /// Row-major `nq x nq` differentiation matrix: `(Du)_i = sum_j d[i * nq + j] u_j`.
    pub d: Vec<f64>,
    /// `HEX_FACES.len() * nfp` volume node indices, face by face.
    pub face_nodes: Vec<usize>,
}

impl ReferenceElement {
    pub fn hex(order: usize) -> Result<Self> {
        if order == 0 {
            return Err(CoreError::InvalidDimensions(
                "Polynomial order must be at least 1".to_string(),
            ));
        }
        let nq = order + 1;
        let (gll_nodes, gll_weights) = gll_nodes_and_weights(order);
        let d = differentiation_matrix(&gll_nodes);

        let np = nq * nq * nq;
        let face_nodes = HEX_FACES
            .iter()
            .flat_map(|&(axis, side)| face_node_indices(nq, axis, side))
            .collect();

        Ok(Self {
            order,
            nq,
            np,
            nfp: nq * nq,
            gll_nodes,
            gll_weights,
            d,
            face_nodes,
        })
    }

    /// Volume node indices on face `face` (an index into [`HEX_FACES`]).
    pub fn face(&self, face: usize) -> &[usize] {
        &self.face_nodes[face * self.nfp..(face + 1) * self.nfp]
    }

    /// Volume node indices on the face normal to `axis`, at `-1` for
    /// `side == 0` and `+1` otherwise.
    pub fn face_on(&self, axis: usize, side: usize) -> Option<&[usize]> {
        let side = usize::from(side != 0);
        HEX_FACES
            .iter()
            .position(|&face| face == (axis, side))
            .map(|face| self.face(face))
    }
}

fn face_node_indices(nq: usize, axis: usize, side: usize) -> Vec<usize> {
    let fixed = if side == 0 { 0 } else { nq - 1 };
    let mut nodes = Vec::with_capacity(nq * nq);
    for b in 0..nq {
        for a in 0..nq {
            let (i, j, k) = match axis {
                0 => (fixed, a, b),
                1 => (a, fixed, b),
                _ => (a, b, fixed),
            };
            nodes.push(i + nq * (j + nq * k));
        }
    }
    nodes
}

/// Legendre polynomials `(P_n(x), P_{n-1}(x))` by the three-term recurrence.
fn legendre_pair(n: usize, x: f64) -> (f64, f64) {
    let mut previous = 1.0;
    let mut current = x;
    for k in 2..=n {
        let k = k as f64;
        let next = ((2.0 * k - 1.0) * x * current - (k - 1.0) * previous) / k;
        previous = current;
        current = next;
    }
    (current, previous)
}

/// GLL nodes (ascending) and weights for polynomial order `order >= 1`.
pub fn gll_nodes_and_weights(order: usize) -> (Vec<f64>, Vec<f64>) {
    let nq = order + 1;
    let n = order as f64;

    // Chebyshev-Gauss-Lobatto points as the starting guess.
    let mut nodes: Vec<f64> = (0..nq).map(|i| -(PI * i as f64 / n).cos()).collect();

    for x in nodes.iter_mut() {
        for _ in 0..NEWTON_MAX_ITERATIONS {
            let (pn, pn1) = legendre_pair(order, *x);
            let step = (*x * pn - pn1) / ((n + 1.0) * pn);
            *x -= step;
            if step.abs() <= f64::EPSILON {
                break;
            }
        }
    }
    nodes[0] = -1.0;
    nodes[order] = 1.0;

    let weights = nodes
        .iter()
        .map(|&x| {
            let (pn, _) = legendre_pair(order, x);
            2.0 / (n * (n + 1.0) * pn * pn)
        })
        .collect();

    (nodes, weights)
}

/// Lagrange differentiation matrix on `nodes`, row-major.
pub fn differentiation_matrix(nodes: &[f64]) -> Vec<f64> {
    let nq = nodes.len();
    let barycentric: Vec<f64> = (0..nq)
        .map(|j| {
            let product: f64 = (0..nq)
                .filter(|&k| k != j)
                .map(|k| nodes[j] - nodes[k])
                .product();
            1.0 / product
        })
        .collect();

    let mut d = vec![0.0; nq * nq];
    for i in 0..nq {
        let mut diagonal = 0.0;
        for j in 0..nq {
            if i != j {
                let value = barycentric[j] / barycentric[i] / (nodes[i] - nodes[j]);
                d[i * nq + j] = value;
                diagonal -= value;
            }
        }
        d[i * nq + i] = diagonal;
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_low_order_nodes_and_weights() {
        let (x, w) = gll_nodes_and_weights(1);
        assert_eq!(x, vec![-1.0, 1.0]);
        assert_abs_diff_eq!(w[0], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(w[1], 1.0, epsilon = 1e-14);

        let (x, w) = gll_nodes_and_weights(2);
        assert_abs_diff_eq!(x[1], 0.0, epsilon = 1e-14);
        assert_abs_diff_eq!(w[0], 1.0 / 3.0, epsilon = 1e-14);
        assert_abs_diff_eq!(w[1], 4.0 / 3.0, epsilon = 1e-14);

        let (x, _) = gll_nodes_and_weights(3);
        assert_abs_diff_eq!(x[1], -(0.2f64.sqrt()), epsilon = 1e-14);
    }

    #[test]
    fn test_quadrature_is_exact_to_degree_2n_minus_1() {
        for order in 1..=8 {
            let (x, w) = gll_nodes_and_weights(order);
            assert_abs_diff_eq!(w.iter().sum::<f64>(), 2.0, epsilon = 1e-12);
            for degree in 0..2 * order {
                let quadrature: f64 = x.iter().zip(&w).map(|(x, w)| w * x.powi(degree as i32)).sum();
                let exact = if degree % 2 == 1 { 0.0 } else { 2.0 / (degree as f64 + 1.0) };
                assert_abs_diff_eq!(quadrature, exact, epsilon = 1e-11);
            }
        }
    }

    #[test]
    fn test_differentiation_matrix_is_exact_for_polynomials() {
        let order = 6;
        let reference = ReferenceElement::hex(order).unwrap();
        let nq = reference.nq;
        let x = &reference.gll_nodes;

        for degree in 0..=order {
            let u: Vec<f64> = x.iter().map(|x| x.powi(degree as i32)).collect();
            for i in 0..nq {
                let du: f64 = (0..nq).map(|j| reference.d[i * nq + j] * u[j]).sum();
                let exact = if degree == 0 {
                    0.0
                } else {
                    degree as f64 * x[i].powi(degree as i32 - 1)
                };
                assert_abs_diff_eq!(du, exact, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_hex_numbering() {
        let reference = ReferenceElement::hex(2).unwrap();
        assert_eq!(reference.np, 27);
        assert_eq!(reference.face_nodes.len(), 6 * 9);
        let nq = reference.nq;

        // Face 2 is r = +1, so i is the last index on every node.
        assert!(reference.face(2).iter().all(|&n| n % nq == nq - 1));
        // Face 0 is t = -1, the first nq^2 nodes.
        assert_eq!(reference.face(0), (0..9).collect::<Vec<_>>().as_slice());
        assert_eq!(reference.face_on(0, 1), Some(reference.face(2)));
        assert_eq!(reference.face_on(0, 0), Some(reference.face(4)));
        assert!(reference.face_on(3, 0).is_none());

        // Every face has distinct nodes.
        for face in 0..HEX_FACES.len() {
            let mut nodes = reference.face(face).to_vec();
            nodes.sort_unstable();
            nodes.dedup();
            assert_eq!(nodes.len(), reference.nfp);
        }
        assert!(ReferenceElement::hex(0).is_err());
    }
}

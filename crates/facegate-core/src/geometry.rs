//! Landmark geometry: how well two five-point landmark sets agree in shape.
//!
//! The candidate landmarks are registered onto the reference with a
//! least-squares 4-DOF similarity transform (scale, rotation, translation),
//! so position and size in the frame do not matter; what remains is the
//! residual shape difference.

use crate::types::Landmarks;

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &Landmarks, dst: &Landmarks) -> Option<[f32; 6]> {
    // Normal equations of the overdetermined system A * [a, b, tx, ty]^T = B.
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb)?;
    Some([a as f32, -b as f32, tx as f32, b as f32, a as f32, ty as f32])
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
/// Returns `None` when the system is singular (e.g. all points coincide).
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f64; 4]; 4], atb: [f64; 4]) -> Option<[f64; 4]> {
    let mut m = [[0.0f64; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))?;
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }
    Some(x)
}

fn apply(matrix: &[f32; 6], (x, y): (f32, f32)) -> (f32, f32) {
    (
        matrix[0] * x + matrix[1] * y + matrix[2],
        matrix[3] * x + matrix[4] * y + matrix[5],
    )
}

/// Distance between the two eye landmarks.
pub fn inter_ocular_distance(landmarks: &Landmarks) -> f32 {
    let (lx, ly) = landmarks[0];
    let (rx, ry) = landmarks[1];
    ((rx - lx).powi(2) + (ry - ly).powi(2)).sqrt()
}

/// Shape similarity in [0, 1] between two landmark sets; 1.0 means the
/// candidate is an exact scaled/rotated/shifted copy of the reference.
///
/// Computed as `1 - rms / iod`, where `rms` is the residual after
/// registering the candidate onto the reference and `iod` is the
/// reference inter-ocular distance. Returns `None` for degenerate
/// landmark sets.
pub fn landmark_similarity(reference: &Landmarks, candidate: &Landmarks) -> Option<f32> {
    let iod = inter_ocular_distance(reference);
    if !iod.is_finite() || iod < 1e-6 || inter_ocular_distance(candidate) < 1e-6 {
        return None;
    }

    let matrix = estimate_similarity_transform(candidate, reference)?;
    let sum_sq: f32 = candidate
        .iter()
        .zip(reference.iter())
        .map(|(&c, &(rx, ry))| {
            let (mx, my) = apply(&matrix, c);
            (mx - rx).powi(2) + (my - ry).powi(2)
        })
        .sum();
    let rms = (sum_sq / candidate.len() as f32).sqrt();

    let similarity = (1.0 - rms / iod).clamp(0.0, 1.0);
    similarity.is_finite().then_some(similarity)
}

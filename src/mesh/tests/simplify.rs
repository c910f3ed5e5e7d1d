//! Simplifier scenarios on small closed and bordered meshes.

use cgmath::Vector3;
use mesh_simplify::{MeshSimplifier, MeshVert};

fn cube() -> (Vec<MeshVert<0>>, Vec<u32>) {
    let verts = (0..8)
        .map(|i| {
            MeshVert::new(Vector3::new(
                (i & 1) as f32,
                ((i >> 1) & 1) as f32,
                ((i >> 2) & 1) as f32,
            ))
        })
        .collect();

    // Two triangles per face, consistently wound.
    let indexes = vec![
        0, 2, 1, 1, 2, 3, // z = 0
        4, 5, 6, 5, 7, 6, // z = 1
        0, 1, 4, 1, 5, 4, // y = 0
        2, 6, 3, 3, 6, 7, // y = 1
        0, 4, 2, 2, 4, 6, // x = 0
        1, 3, 5, 3, 7, 5, // x = 1
    ];
    (verts, indexes)
}

fn grid(side: u32) -> (Vec<MeshVert<1>>, Vec<u32>) {
    let mut verts = Vec::new();
    for y in 0..=side {
        for x in 0..=side {
            let mut vert = MeshVert::new(Vector3::new(x as f32, y as f32, 0.0));
            vert.attrs = [x as f32];
            verts.push(vert);
        }
    }

    let stride = side + 1;
    let mut indexes = Vec::new();
    for y in 0..side {
        for x in 0..side {
            let a = y * stride + x;
            let b = a + 1;
            let c = a + stride;
            let d = c + 1;
            indexes.extend_from_slice(&[a, c, b, b, c, d]);
        }
    }
    (verts, indexes)
}

/// Counts how often each unordered vertex pair appears as a triangle edge.
fn edge_face_counts(indexes: &[u32]) -> Vec<((u32, u32), u32)> {
    let mut counts: Vec<((u32, u32), u32)> = Vec::new();
    for tri in indexes.chunks_exact(3) {
        for k in 0..3 {
            let (u, v) = (tri[k], tri[(k + 1) % 3]);
            let pair = (u.min(v), u.max(v));
            match counts.iter_mut().find(|(p, _)| *p == pair) {
                Some((_, count)) => *count += 1,
                None => counts.push((pair, 1)),
            }
        }
    }
    counts
}

#[test]
fn test_cube_single_collapse() {
    let (verts, indexes) = cube();
    let mut simplifier = MeshSimplifier::<0>::new(&verts, &indexes);
    assert_eq!(simplifier.num_verts(), 8);
    assert_eq!(simplifier.num_tris(), 12);

    simplifier.init_costs();
    // Stop after the first collapse: one interior edge takes two triangles
    // and one vertex with it.
    simplifier.simplify(f32::MAX, 10);
    assert_eq!(simplifier.num_tris(), 10);
    assert_eq!(simplifier.num_verts(), 7);

    let (out_verts, out_indexes) = simplifier.output_mesh();
    assert_eq!(out_verts.len(), 7);
    assert_eq!(out_indexes.len(), 30);

    // Still a closed 2-manifold: V - E + F = 2 and every edge has two
    // faces.
    let counts = edge_face_counts(&out_indexes);
    assert_eq!(counts.len(), 15);
    assert!(counts.iter().all(|&(_, count)| count == 2));
}

#[test]
fn test_cube_collapse_to_minimum() {
    let (verts, indexes) = cube();
    let mut simplifier = MeshSimplifier::<0>::new(&verts, &indexes);
    simplifier.init_costs();
    simplifier.simplify(f32::MAX, 4);
    assert!(simplifier.num_tris() <= 4);

    let (_, out_indexes) = simplifier.output_mesh();
    assert_eq!(out_indexes.len() as u32, simplifier.num_tris() * 3);
}

#[test]
fn test_locked_boundary_is_preserved() {
    let side = 4;
    let (verts, indexes) = grid(side);
    let mut simplifier = MeshSimplifier::<1>::new(&verts, &indexes);
    simplifier.set_attribute_weights(&[1.0]);
    simplifier.set_boundary_locked();
    simplifier.init_costs();
    simplifier.simplify(f32::MAX, 0);

    // Interior collapses happened, the border did not move.
    assert!(simplifier.num_tris() < 2 * side * side);

    let (out_verts, out_indexes) = simplifier.output_mesh();
    assert!(!out_indexes.is_empty());

    let boundary: Vec<Vector3<f32>> = verts
        .iter()
        .map(|v| v.pos)
        .filter(|p| {
            p.x == 0.0 || p.y == 0.0 || p.x == side as f32 || p.y == side as f32
        })
        .collect();
    for expected in &boundary {
        assert!(
            out_verts.iter().any(|v| v.pos == *expected),
            "boundary vert {:?} went missing",
            expected
        );
    }

    // Everything still lies in the plane.
    assert!(out_verts.iter().all(|v| v.pos.z == 0.0));
}

#[test]
fn test_attributes_follow_position() {
    // The attribute field is x; collapsed verts must keep attr == x.
    let (verts, indexes) = grid(4);
    let mut simplifier = MeshSimplifier::<1>::new(&verts, &indexes);
    simplifier.set_attribute_weights(&[1.0]);
    simplifier.set_boundary_locked();
    simplifier.init_costs();
    simplifier.simplify(f32::MAX, 0);

    let (out_verts, _) = simplifier.output_mesh();
    for vert in &out_verts {
        assert!(
            (vert.attrs[0] - vert.pos.x).abs() < 1e-3,
            "attr {} at x {}",
            vert.attrs[0],
            vert.pos.x
        );
    }
}

#[test]
fn test_degenerate_input_is_dropped() {
    let verts = vec![
        MeshVert::<0>::new(Vector3::new(0.0, 0.0, 0.0)),
        MeshVert::<0>::new(Vector3::new(1.0, 0.0, 0.0)),
        MeshVert::<0>::new(Vector3::new(0.0, 1.0, 0.0)),
    ];
    // One real triangle, one with a repeated index.
    let indexes = vec![0, 1, 2, 0, 1, 1];
    let simplifier = MeshSimplifier::<0>::new(&verts, &indexes);
    assert_eq!(simplifier.num_tris(), 1);
}

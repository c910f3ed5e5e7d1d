//! Edge-collapse simplification engine.

use cgmath::{InnerSpace, Vector3};
use smallvec::SmallVec;

use index_collections::{murmur32, BinaryHeap, HashTable};

use crate::elements::{flags, MeshVert, SimpEdge, SimpTri, SimpVert};
use crate::quadric::{Quadric, QuadricAttr, QuadricAttrOptimizer};

const INVALID: u32 = !0u32;

/// Added per triangle whose normal would flip under a collapse.
const FLIP_PENALTY: f32 = 1e10;
/// `dot(old_normal, new_normal)` at or below this counts as a flip.
const FLIP_THRESHOLD: f32 = 0.0;
/// Boundary edge constraint strength.
const EDGE_WEIGHT: f32 = 16.0;

#[inline]
fn position_bits(value: f32) -> u32 {
    // Collapse -0.0 onto 0.0 so coincident verts hash together.
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

#[inline]
fn hash_position(p: Vector3<f32>) -> u32 {
    murmur32(&[
        position_bits(p.x),
        position_bits(p.y),
        position_bits(p.z),
    ])
}

#[inline]
fn hash_edge(p0: Vector3<f32>, p1: Vector3<f32>) -> u16 {
    let h0 = hash_position(p0);
    let h1 = hash_position(p1);
    murmur32(&[h0.min(h1), h0.max(h1)]) as u16
}

struct CollapseEval {
    position: Vector3<f32>,
    cost: f32,
}

/// Quadric error simplifier over an indexed triangle mesh with `N` scalar
/// attributes per vertex.
pub struct MeshSimplifier<const N: usize> {
    verts: Vec<SimpVert<N>>,
    tris: Vec<SimpTri>,
    edges: Vec<SimpEdge>,

    edge_hash: HashTable,
    edge_heap: BinaryHeap<f32>,

    attribute_weights: [f32; N],

    num_verts: u32,
    num_tris: u32,

    vert_quadrics: Vec<QuadricAttr<N>>,
    vert_quadrics_valid: Vec<bool>,
    // Boundary constraint quadrics, cached per vert like the face sums.
    edge_quadrics: Vec<Quadric>,
    edge_quadrics_valid: Vec<bool>,
}

impl<const N: usize> MeshSimplifier<N> {
    /// Builds the working tables: verts, triangles, deduplicated edges,
    /// coincident-position vertex rings, and seam edge rings.
    pub fn new(in_verts: &[MeshVert<N>], in_indexes: &[u32]) -> Self {
        let num_verts = in_verts.len();

        let mut verts: Vec<SimpVert<N>> = in_verts
            .iter()
            .enumerate()
            .map(|(i, v)| SimpVert::new(i as u32, *v))
            .collect();

        // Group verts coincident in position into sibling rings.
        {
            let hash_size = (num_verts as u32).next_power_of_two().min(0x10000).max(16);
            let mut hash = HashTable::new(hash_size, num_verts as u32);
            for v in 0..num_verts as u32 {
                let key = hash_position(verts[v as usize].vert.pos) as u16;
                let mut head = INVALID;
                for u in hash.iter(key) {
                    if verts[u as usize].vert.pos == verts[v as usize].vert.pos {
                        head = u;
                        break;
                    }
                }
                if head == INVALID {
                    hash.add(key, v);
                } else {
                    // Insert after the head.
                    let next = verts[head as usize].next;
                    verts[v as usize].next = next;
                    verts[v as usize].prev = head;
                    verts[next as usize].prev = v;
                    verts[head as usize].next = v;
                }
            }
        }

        // Triangles; degenerate input (repeated index or repeated
        // position) is dropped up front.
        let mut tris = Vec::with_capacity(in_indexes.len() / 3);
        for chunk in in_indexes.chunks_exact(3) {
            let t = [chunk[0], chunk[1], chunk[2]];
            let p0 = verts[t[0] as usize].vert.pos;
            let p1 = verts[t[1] as usize].vert.pos;
            let p2 = verts[t[2] as usize].vert.pos;
            if t[0] == t[1] || t[1] == t[2] || t[2] == t[0] || p0 == p1 || p1 == p2 || p2 == p0 {
                continue;
            }

            let tri_index = tris.len() as u32;
            tris.push(SimpTri::new(t));
            for &v in &t {
                verts[v as usize].adj_tris.add(tri_index);
            }
        }
        let num_tris = tris.len() as u32;

        // Unique edges per vert pair, collected from the triangle soup.
        let mut edges: Vec<SimpEdge> = Vec::with_capacity(tris.len() * 3 / 2);
        {
            let hash_size = (tris.len() as u32 * 3).next_power_of_two().min(0x10000).max(16);
            let mut pair_hash = HashTable::new(hash_size, tris.len() as u32 * 3);
            for tri in &tris {
                for k in 0..3 {
                    let u = tri.verts[k];
                    let v = tri.verts[(k + 1) % 3];
                    let key = murmur32(&[u.min(v), u.max(v)]) as u16;

                    let mut found = false;
                    for e in pair_hash.iter(key) {
                        let edge = &edges[e as usize];
                        if (edge.v0 == u && edge.v1 == v) || (edge.v0 == v && edge.v1 == u) {
                            found = true;
                            break;
                        }
                    }
                    if !found {
                        let index = edges.len() as u32;
                        edges.push(SimpEdge::new(index, u, v));
                        pair_hash.add(key, index);
                    }
                }
            }
        }

        // Group edges sharing endpoint positions into seam rings, and index
        // them by position pair for later lookups.
        let num_edges = edges.len();
        let edge_hash_size = (num_edges as u32).next_power_of_two().min(0x10000).max(16);
        let mut edge_hash = HashTable::new(edge_hash_size, num_edges as u32);
        for e in 0..num_edges as u32 {
            let (p0, p1) = {
                let edge = &edges[e as usize];
                (
                    verts[edge.v0 as usize].vert.pos,
                    verts[edge.v1 as usize].vert.pos,
                )
            };
            let key = hash_edge(p0, p1);

            let mut partner = INVALID;
            for f in edge_hash.iter(key) {
                let other = &edges[f as usize];
                let q0 = verts[other.v0 as usize].vert.pos;
                let q1 = verts[other.v1 as usize].vert.pos;
                if (q0 == p0 && q1 == p1) || (q0 == p1 && q1 == p0) {
                    partner = f;
                    break;
                }
            }
            if partner != INVALID {
                let next = edges[partner as usize].next;
                edges[e as usize].next = next;
                edges[e as usize].prev = partner;
                edges[next as usize].prev = e;
                edges[partner as usize].next = e;
            }
            edge_hash.add(key, e);
        }

        let edge_heap = BinaryHeap::new(num_edges as u32, num_edges as u32);

        MeshSimplifier {
            vert_quadrics: vec![QuadricAttr::zero(); num_verts],
            vert_quadrics_valid: vec![false; num_verts],
            edge_quadrics: vec![Quadric::zero(); num_verts],
            edge_quadrics_valid: vec![false; num_verts],
            verts,
            tris,
            edges,
            edge_hash,
            edge_heap,
            attribute_weights: [1.0; N],
            num_verts: num_verts as u32,
            num_tris,
        }
    }

    pub fn num_verts(&self) -> u32 {
        self.num_verts
    }

    pub fn num_tris(&self) -> u32 {
        self.num_tris
    }

    pub fn set_attribute_weights(&mut self, weights: &[f32; N]) {
        self.attribute_weights = *weights;
        for valid in &mut self.vert_quadrics_valid {
            *valid = false;
        }
    }

    /// Locks every vertex group touching a topological boundary edge: an
    /// edge whose seam ring has exactly one adjacent face in total.
    pub fn set_boundary_locked(&mut self) {
        let mut visited = vec![false; self.edges.len()];
        for e in 0..self.edges.len() as u32 {
            if visited[e as usize] || self.edges[e as usize].test_flags(flags::SIMP_REMOVED) {
                continue;
            }

            let ring = self.edge_ring(e);
            let mut num_faces = 0;
            for &member in &ring {
                visited[member as usize] = true;
                let (v0, v1) = {
                    let edge = &self.edges[member as usize];
                    (edge.v0, edge.v1)
                };
                num_faces += self.num_tris_with_pair(v0, v1);
            }

            if num_faces == 1 {
                let (v0, v1) = {
                    let edge = &self.edges[e as usize];
                    (edge.v0, edge.v1)
                };
                for &v in self.vert_group(v0).iter().chain(self.vert_group(v1).iter()) {
                    self.verts[v as usize].flags |= flags::SIMP_LOCKED;
                }
            }
        }
    }

    /// Computes every edge's collapse cost and fills the heap.
    pub fn init_costs(&mut self) {
        for e in 0..self.edges.len() as u32 {
            if !self.edges[e as usize].test_flags(flags::SIMP_REMOVED) {
                let cost = self.compute_edge_collapse_cost(e);
                self.edge_heap.update(cost, e);
            }
        }
    }

    /// Pops and applies collapses until the heap runs dry, the next-best
    /// cost exceeds `max_error`, or the triangle count reaches `min_tris`.
    /// Returns the largest cost actually applied.
    pub fn simplify(&mut self, max_error: f32, min_tris: u32) -> f32 {
        let mut max_used = 0.0f32;
        while !self.edge_heap.is_empty() {
            if self.num_tris <= min_tris {
                break;
            }
            let top = self.edge_heap.top();
            let cost = self.edge_heap.get_key(top);
            if cost > max_error {
                break;
            }
            self.edge_heap.pop();

            if self.edges[top as usize].test_flags(flags::SIMP_REMOVED) {
                continue;
            }

            max_used = max_used.max(cost);
            self.collapse(top);
        }
        debug!(
            "simplified to {} tris, {} verts, max error {}",
            self.num_tris, self.num_verts, max_used
        );
        max_used
    }

    /// Compacts the remaining mesh into caller buffers.
    pub fn output_mesh(&self) -> (Vec<MeshVert<N>>, Vec<u32>) {
        let mut remap = vec![INVALID; self.verts.len()];
        let mut out_verts = Vec::new();
        let mut out_indexes = Vec::new();

        for tri in &self.tris {
            if tri.test_flags(flags::SIMP_REMOVED) {
                continue;
            }
            for &v in &tri.verts {
                if remap[v as usize] == INVALID {
                    remap[v as usize] = out_verts.len() as u32;
                    out_verts.push(self.verts[v as usize].vert);
                }
                out_indexes.push(remap[v as usize]);
            }
        }

        (out_verts, out_indexes)
    }

    // Ring and adjacency helpers.

    fn vert_group(&self, v: u32) -> SmallVec<[u32; 8]> {
        let mut group = SmallVec::new();
        let mut i = v;
        loop {
            group.push(i);
            i = self.verts[i as usize].next;
            if i == v {
                break;
            }
        }
        group
    }

    fn edge_ring(&self, e: u32) -> SmallVec<[u32; 4]> {
        let mut ring = SmallVec::new();
        let mut i = e;
        loop {
            ring.push(i);
            i = self.edges[i as usize].next;
            if i == e {
                break;
            }
        }
        ring
    }

    fn unlink_vert(&mut self, v: u32) {
        let (prev, next) = (self.verts[v as usize].prev, self.verts[v as usize].next);
        self.verts[prev as usize].next = next;
        self.verts[next as usize].prev = prev;
        self.verts[v as usize].next = v;
        self.verts[v as usize].prev = v;
    }

    fn unlink_edge(&mut self, e: u32) {
        let (prev, next) = (self.edges[e as usize].prev, self.edges[e as usize].next);
        self.edges[prev as usize].next = next;
        self.edges[next as usize].prev = prev;
        self.edges[e as usize].next = e;
        self.edges[e as usize].prev = e;
    }

    fn num_tris_with_pair(&self, u: u32, v: u32) -> u32 {
        self.verts[u as usize]
            .adj_tris
            .iter()
            .filter(|&&t| self.tris[t as usize].has_vertex(v))
            .count() as u32
    }

    fn find_edge(&self, u: u32, v: u32) -> Option<u32> {
        let key = hash_edge(
            self.verts[u as usize].vert.pos,
            self.verts[v as usize].vert.pos,
        );
        for e in self.edge_hash.iter(key) {
            let edge = &self.edges[e as usize];
            if (edge.v0 == u && edge.v1 == v) || (edge.v0 == v && edge.v1 == u) {
                return Some(e);
            }
        }
        None
    }

    fn edge_hash_key(&self, e: u32) -> u16 {
        let edge = &self.edges[e as usize];
        hash_edge(
            self.verts[edge.v0 as usize].vert.pos,
            self.verts[edge.v1 as usize].vert.pos,
        )
    }

    fn tri_normal(&self, t: u32) -> Vector3<f32> {
        let tri = &self.tris[t as usize];
        let p0 = self.verts[tri.verts[0] as usize].vert.pos;
        let p1 = self.verts[tri.verts[1] as usize].vert.pos;
        let p2 = self.verts[tri.verts[2] as usize].vert.pos;
        let n = (p2 - p0).cross(p1 - p0);
        let length = n.magnitude();
        if length < 1e-12 {
            Vector3::new(0.0, 0.0, 0.0)
        } else {
            n / length
        }
    }

    // Quadric caches.

    fn get_quadric(&mut self, v: u32) -> QuadricAttr<N> {
        if !self.vert_quadrics_valid[v as usize] {
            let mut quadric = QuadricAttr::zero();
            let adj: SmallVec<[u32; 16]> = self.verts[v as usize].adj_tris.iter().copied().collect();
            for t in adj {
                let tri = &self.tris[t as usize];
                let v0 = &self.verts[tri.verts[0] as usize].vert;
                let v1 = &self.verts[tri.verts[1] as usize].vert;
                let v2 = &self.verts[tri.verts[2] as usize].vert;
                quadric.add(&QuadricAttr::from_triangle(
                    v0.pos,
                    v1.pos,
                    v2.pos,
                    &v0.attrs,
                    &v1.attrs,
                    &v2.attrs,
                    &self.attribute_weights,
                ));
            }
            self.vert_quadrics[v as usize] = quadric;
            self.vert_quadrics_valid[v as usize] = true;
        }
        self.vert_quadrics[v as usize]
    }

    fn get_edge_quadric(&mut self, v: u32) -> Quadric {
        if !self.edge_quadrics_valid[v as usize] {
            let mut quadric = Quadric::zero();
            let adj: SmallVec<[u32; 16]> = self.verts[v as usize].adj_tris.iter().copied().collect();
            for &t in &adj {
                let tri = &self.tris[t as usize];
                for &u in &tri.verts {
                    if u == v {
                        continue;
                    }
                    if self.num_tris_with_pair(v, u) == 1 {
                        // Open edge: constrain movement off of it.
                        quadric.add(&Quadric::from_boundary_edge(
                            self.verts[v as usize].vert.pos,
                            self.verts[u as usize].vert.pos,
                            self.tri_normal(t),
                            EDGE_WEIGHT,
                        ));
                    }
                }
            }
            self.edge_quadrics[v as usize] = quadric;
            self.edge_quadrics_valid[v as usize] = true;
        }
        self.edge_quadrics[v as usize]
    }

    // Collapse evaluation.

    fn compute_collapse(&mut self, e: u32) -> CollapseEval {
        let (v0, v1) = {
            let edge = &self.edges[e as usize];
            (edge.v0, edge.v1)
        };
        let group0 = self.vert_group(v0);
        let group1 = self.vert_group(v1);

        let locked0 = group0
            .iter()
            .any(|&v| self.verts[v as usize].test_flags(flags::SIMP_LOCKED));
        let locked1 = group1
            .iter()
            .any(|&v| self.verts[v as usize].test_flags(flags::SIMP_LOCKED));

        let p0 = self.verts[v0 as usize].vert.pos;
        let p1 = self.verts[v1 as usize].vert.pos;
        let midpoint = (p0 + p1) * 0.5;

        let position = if locked0 {
            p0
        } else if locked1 {
            p1
        } else {
            let mut optimizer = QuadricAttrOptimizer::<N>::new();
            for &v in group0.iter().chain(group1.iter()) {
                let quadric = self.get_quadric(v);
                optimizer.add_quadric_attr(&quadric);
                let edge_quadric = self.get_edge_quadric(v);
                optimizer.add_quadric(&edge_quadric);
            }
            optimizer.optimize().unwrap_or(midpoint)
        };

        if locked0 && locked1 {
            return CollapseEval {
                position: midpoint,
                cost: f32::INFINITY,
            };
        }

        let mut cost = 0.0f32;
        for &v in group0.iter().chain(group1.iter()) {
            let quadric = self.get_quadric(v);
            let mut attrs = self.verts[v as usize].vert.attrs;
            if quadric.a != 0.0 {
                quadric.calc_attributes(position, &mut attrs, &self.attribute_weights);
            }
            cost += quadric.evaluate(position, &attrs, &self.attribute_weights);
            cost += self.get_edge_quadric(v).evaluate(position);
        }

        if locked0 || locked1 {
            return CollapseEval {
                position,
                cost: f32::INFINITY,
            };
        }

        // Normal flip penalty over every surviving triangle that would have
        // a vert moved to the new position.
        let mut seen: SmallVec<[u32; 32]> = SmallVec::new();
        for &v in group0.iter().chain(group1.iter()) {
            let adj: SmallVec<[u32; 16]> = self.verts[v as usize].adj_tris.iter().copied().collect();
            for t in adj {
                if seen.contains(&t) {
                    continue;
                }
                seen.push(t);

                let tri = &self.tris[t as usize];
                let in0 = tri.verts.iter().any(|w| group0.contains(w));
                let in1 = tri.verts.iter().any(|w| group1.contains(w));
                if in0 && in1 {
                    // Degenerates and gets removed; no penalty.
                    continue;
                }

                let old_normal = self.tri_normal(t);
                let mut positions = [Vector3::new(0.0, 0.0, 0.0); 3];
                for (k, &w) in tri.verts.iter().enumerate() {
                    positions[k] = if group0.contains(&w) || group1.contains(&w) {
                        position
                    } else {
                        self.verts[w as usize].vert.pos
                    };
                }
                let new_cross = (positions[2] - positions[0]).cross(positions[1] - positions[0]);
                let new_length = new_cross.magnitude();
                if new_length < 1e-12 {
                    cost += FLIP_PENALTY;
                    continue;
                }
                if old_normal.dot(new_cross / new_length) <= FLIP_THRESHOLD {
                    cost += FLIP_PENALTY;
                }
            }
        }

        CollapseEval { position, cost }
    }

    fn compute_edge_collapse_cost(&mut self, e: u32) -> f32 {
        self.compute_collapse(e).cost
    }

    fn kill_edge(&mut self, e: u32) {
        self.unlink_edge(e);
        self.edge_heap.remove(e);
        self.edges[e as usize].flags |= flags::SIMP_REMOVED;
    }

    fn remove_tri(&mut self, t: u32) {
        if self.tris[t as usize].test_flags(flags::SIMP_REMOVED) {
            return;
        }
        self.tris[t as usize].flags |= flags::SIMP_REMOVED;
        self.num_tris -= 1;
        let tri_verts = self.tris[t as usize].verts;
        for v in tri_verts.iter() {
            self.verts[*v as usize].adj_tris.remove(t);
        }
    }

    /// Applies the collapse of `e`'s whole seam ring: merges the endpoint
    /// groups at the optimal position, removes degenerated triangles, and
    /// re-evaluates the surrounding neighborhood.
    fn collapse(&mut self, e: u32) {
        let eval = self.compute_collapse(e);
        debug_assert!(eval.cost.is_finite());

        let (v0, v1) = {
            let edge = &self.edges[e as usize];
            (edge.v0, edge.v1)
        };
        let group0 = self.vert_group(v0);
        let group1 = self.vert_group(v1);

        // New attributes, solved per vert against its own quadric before
        // anything moves.
        let mut new_attrs: SmallVec<[(u32, [f32; N]); 8]> = SmallVec::new();
        for &v in group0.iter().chain(group1.iter()) {
            let quadric = self.get_quadric(v);
            let mut attrs = self.verts[v as usize].vert.attrs;
            if quadric.a != 0.0 {
                quadric.calc_attributes(eval.position, &mut attrs, &self.attribute_weights);
            }
            new_attrs.push((v, attrs));
        }

        // Seam pairs: each ring member merges its group1-side vert into its
        // group0-side vert.
        let mut pairs: SmallVec<[(u32, u32); 4]> = SmallVec::new();
        for &member in &self.edge_ring(e) {
            let edge = &self.edges[member as usize];
            if group0.contains(&edge.v0) {
                pairs.push((edge.v0, edge.v1));
            } else {
                pairs.push((edge.v1, edge.v0));
            }
        }

        // Affected triangles and edges, captured before any rewrite while
        // positions still match the hash keys.
        let mut affected_tris: SmallVec<[u32; 32]> = SmallVec::new();
        for &v in group0.iter().chain(group1.iter()) {
            for &t in self.verts[v as usize].adj_tris.iter() {
                if !affected_tris.contains(&t) {
                    affected_tris.push(t);
                }
            }
        }

        let mut affected_edges: SmallVec<[u32; 32]> = SmallVec::new();
        for &t in &affected_tris {
            let tri_verts = self.tris[t as usize].verts;
            for k in 0..3 {
                if let Some(edge) = self.find_edge(tri_verts[k], tri_verts[(k + 1) % 3]) {
                    for &member in &self.edge_ring(edge) {
                        if !affected_edges.contains(&member) {
                            affected_edges.push(member);
                        }
                    }
                }
            }
        }

        // Everything affected leaves the hash; survivors rejoin with their
        // post-collapse keys.
        for &ae in &affected_edges {
            let key = self.edge_hash_key(ae);
            self.edge_hash.remove(key, ae);
        }

        // Drop triangles spanning both groups.
        for &t in &affected_tris {
            let tri = &self.tris[t as usize];
            if tri.test_flags(flags::SIMP_REMOVED) {
                continue;
            }
            let in0 = tri.verts.iter().any(|w| group0.contains(w));
            let in1 = tri.verts.iter().any(|w| group1.contains(w));
            if in0 && in1 {
                self.remove_tri(t);
            }
        }

        // Merge each pair: retarget triangles and edges, move adjacency,
        // drop the group1-side vert.
        for &(keep, drop) in &pairs {
            debug_assert_ne!(keep, drop);
            if self.verts[drop as usize].test_flags(flags::SIMP_REMOVED) {
                continue;
            }
            let drop_tris: SmallVec<[u32; 16]> =
                self.verts[drop as usize].adj_tris.iter().copied().collect();
            for t in drop_tris {
                self.tris[t as usize].replace_vertex(drop, keep);
                self.verts[keep as usize].adj_tris.add(t);
            }
            self.verts[drop as usize].adj_tris.clear();

            for &ae in &affected_edges {
                let edge = &mut self.edges[ae as usize];
                if edge.v0 == drop {
                    edge.v0 = keep;
                }
                if edge.v1 == drop {
                    edge.v1 = keep;
                }
            }

            self.unlink_vert(drop);
            self.verts[drop as usize].flags |= flags::SIMP_REMOVED;
            self.num_verts -= 1;
        }

        // Survivors of both groups move to the new position and re-group
        // into a single ring.
        let mut survivors: SmallVec<[u32; 8]> = SmallVec::new();
        for &(v, attrs) in &new_attrs {
            if self.verts[v as usize].test_flags(flags::SIMP_REMOVED) {
                continue;
            }
            self.verts[v as usize].vert.pos = eval.position;
            self.verts[v as usize].vert.attrs = attrs;
            survivors.push(v);
        }
        for &v in &survivors {
            self.unlink_vert(v);
        }
        for window in survivors.windows(2) {
            let (a, b) = (window[0], window[1]);
            let next = self.verts[a as usize].next;
            self.verts[b as usize].next = next;
            self.verts[b as usize].prev = a;
            self.verts[next as usize].prev = b;
            self.verts[a as usize].next = b;
        }

        // Sort the affected edges back out: degenerates, orphans and
        // duplicates die, the rest rejoin the hash as singleton rings.
        let mut kept: SmallVec<[u32; 32]> = SmallVec::new();
        for &ae in &affected_edges {
            self.unlink_edge(ae);
            if self.edges[ae as usize].test_flags(flags::SIMP_REMOVED) {
                continue;
            }
            let (u, v) = {
                let edge = &self.edges[ae as usize];
                (edge.v0, edge.v1)
            };
            let dead = u == v
                || self.verts[u as usize].test_flags(flags::SIMP_REMOVED)
                || self.verts[v as usize].test_flags(flags::SIMP_REMOVED)
                || self.num_tris_with_pair(u, v) == 0
                || kept.iter().any(|&k| {
                    let other = &self.edges[k as usize];
                    (other.v0 == u && other.v1 == v) || (other.v0 == v && other.v1 == u)
                });
            if dead {
                self.kill_edge(ae);
            } else {
                kept.push(ae);
            }
        }

        // Re-ring and re-hash the keepers.
        for i in 0..kept.len() {
            let ae = kept[i];
            let key = self.edge_hash_key(ae);
            let (p0, p1) = {
                let edge = &self.edges[ae as usize];
                (
                    self.verts[edge.v0 as usize].vert.pos,
                    self.verts[edge.v1 as usize].vert.pos,
                )
            };
            for &other in &kept[..i] {
                let (q0, q1) = {
                    let edge = &self.edges[other as usize];
                    (
                        self.verts[edge.v0 as usize].vert.pos,
                        self.verts[edge.v1 as usize].vert.pos,
                    )
                };
                if (q0 == p0 && q1 == p1) || (q0 == p1 && q1 == p0) {
                    let next = self.edges[other as usize].next;
                    self.edges[ae as usize].next = next;
                    self.edges[ae as usize].prev = other;
                    self.edges[next as usize].prev = ae;
                    self.edges[other as usize].next = ae;
                    break;
                }
            }
            self.edge_hash.add(key, ae);
        }

        // Invalidate quadric caches across the one-ring.
        let mut dirty_verts: SmallVec<[u32; 32]> = SmallVec::new();
        dirty_verts.extend(survivors.iter().copied());
        for &t in &affected_tris {
            if self.tris[t as usize].test_flags(flags::SIMP_REMOVED) {
                continue;
            }
            for &w in &self.tris[t as usize].verts {
                if !dirty_verts.contains(&w) {
                    dirty_verts.push(w);
                }
            }
        }
        for &v in &dirty_verts {
            self.vert_quadrics_valid[v as usize] = false;
            self.edge_quadrics_valid[v as usize] = false;
        }

        // Re-cost every edge whose endpoints read those quadrics.
        let mut update_edges: SmallVec<[u32; 64]> = SmallVec::new();
        for &v in &dirty_verts {
            let adj: SmallVec<[u32; 16]> = self.verts[v as usize].adj_tris.iter().copied().collect();
            for t in adj {
                let tri_verts = self.tris[t as usize].verts;
                for k in 0..3 {
                    let (a, b) = (tri_verts[k], tri_verts[(k + 1) % 3]);
                    if !dirty_verts.contains(&a) && !dirty_verts.contains(&b) {
                        continue;
                    }
                    if let Some(edge) = self.find_edge(a, b) {
                        if !update_edges.contains(&edge) {
                            update_edges.push(edge);
                        }
                    }
                }
            }
        }
        for i in 0..update_edges.len() {
            let edge = update_edges[i];
            let cost = self.compute_edge_collapse_cost(edge);
            self.edge_heap.update(cost, edge);
        }
    }
}

use hashbrown::HashMap;
use pcd_register_core::{ensure_positive, Colors, Error, Normals, PointCloud, Result};
use tracing::debug;

type VoxelKey = (i32, i32, i32);

#[derive(Default, Clone, Copy)]
struct VoxelAccum {
    sx: f64,
    sy: f64,
    sz: f64,
    nx: f64,
    ny: f64,
    nz: f64,
    r: u64,
    g: u64,
    b: u64,
    n: usize,
}

impl VoxelAccum {
    fn add_color(&mut self, [r, g, b]: [u8; 3]) {
        self.r += u64::from(r);
        self.g += u64::from(g);
        self.b += u64::from(b);
    }

    fn mean_color(&self) -> [u8; 3] {
        let denom = self.n as f64;
        let avg = |s: u64| (s as f64 / denom).round().min(255.0) as u8;
        [avg(self.r), avg(self.g), avg(self.b)]
    }
}

/// Replace every occupied voxel of edge `voxel_size` by the centroid of its
/// points.
///
/// Normals are averaged and re-normalized, colors averaged and rounded.
/// Output points are ordered by voxel key, so the result does not depend on
/// hash iteration order. Non-finite points are dropped.
///
/// Sums are kept in `f64` and keys are computed in `f64`, so a centroid always
/// falls back into its own voxel: running the filter again at the same size
/// keeps the point count.
pub fn voxel_downsample(cloud: &PointCloud, voxel_size: f32) -> Result<PointCloud> {
    ensure_positive("voxel_size", voxel_size)?;
    let inv = 1.0 / voxel_size as f64;

    let reach = cloud.aabb().max_abs_coordinate() as f64 * inv;
    if reach >= i32::MAX as f64 {
        return Err(Error::invalid(
            "voxel_size",
            format!("{voxel_size} is too small for a cloud reaching {reach:.3e} voxels from the origin"),
        ));
    }

    if cloud.is_empty() {
        return Ok(PointCloud::new());
    }

    let normals = cloud.normals.as_ref().filter(|n| n.len() == cloud.len());
    let colors = cloud.colors.as_ref().filter(|c| c.len() == cloud.len());

    let mut bins: HashMap<VoxelKey, VoxelAccum> = HashMap::new();

    for i in 0..cloud.len() {
        let [px, py, pz] = cloud.point(i);
        if !px.is_finite() || !py.is_finite() || !pz.is_finite() {
            continue;
        }

        let key = (
            (px as f64 * inv).floor() as i32,
            (py as f64 * inv).floor() as i32,
            (pz as f64 * inv).floor() as i32,
        );

        let entry = bins.entry(key).or_default();
        entry.sx += px as f64;
        entry.sy += py as f64;
        entry.sz += pz as f64;
        if let Some(normals) = normals {
            if normals.is_valid(i) {
                let [nx, ny, nz] = normals.normal(i);
                entry.nx += nx as f64;
                entry.ny += ny as f64;
                entry.nz += nz as f64;
            }
        }
        if let Some(colors) = colors {
            entry.add_color(colors.color(i));
        }
        entry.n += 1;
    }

    let mut keys: Vec<VoxelKey> = bins.keys().copied().collect();
    keys.sort_unstable();

    let mut x = Vec::with_capacity(keys.len());
    let mut y = Vec::with_capacity(keys.len());
    let mut z = Vec::with_capacity(keys.len());
    let mut out_normals = normals.map(|_| Normals::with_capacity(keys.len()));
    let mut out_colors = colors.map(|_| Colors::default());

    for key in &keys {
        let a = &bins[key];
        let denom = a.n as f64;
        x.push((a.sx / denom) as f32);
        y.push((a.sy / denom) as f32);
        z.push((a.sz / denom) as f32);

        if let Some(out) = out_normals.as_mut() {
            let len = (a.nx * a.nx + a.ny * a.ny + a.nz * a.nz).sqrt();
            if len > 1e-12 {
                out.push([(a.nx / len) as f32, (a.ny / len) as f32, (a.nz / len) as f32]);
            } else {
                out.push([0.0; 3]);
            }
        }
        if let Some(out) = out_colors.as_mut() {
            let [r, g, b] = a.mean_color();
            out.r.push(r);
            out.g.push(g);
            out.b.push(b);
        }
    }

    debug!(
        input = cloud.len(),
        output = x.len(),
        voxel_size,
        "voxel downsample"
    );

    Ok(PointCloud {
        normals: out_normals,
        colors: out_colors,
        ..PointCloud::from_xyz(x, y, z)
    })
}

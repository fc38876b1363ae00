// output.rs — Writing mapped results to disk.
//
//   voxels  raw bytes, x fastest then y then z
//   image   binary PGM (P5), 8-bit grey
//   debug   raw little-endian f32, row-major

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::extract::HostGrid;

/// Write the voxel grid as raw bytes.
pub fn save_voxels(path: &Path, voxels: &HostGrid<u8>) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(voxels.data())?;
    w.flush()
}

/// Encode an 8-bit grey image as binary PGM.
pub fn write_pgm<W: Write>(mut w: W, image: &HostGrid<u8>) -> io::Result<()> {
    let shape = image.shape();
    write!(w, "P5\n{} {}\n255\n", shape.width(), shape.height())?;
    w.write_all(image.data())?;
    w.flush()
}

pub fn save_pgm(path: &Path, image: &HostGrid<u8>) -> io::Result<()> {
    write_pgm(BufWriter::new(File::create(path)?), image)
}

pub fn save_debug(path: &Path, debug: &HostGrid<f32>) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    for v in debug.data() {
        w.write_all(&v.to_le_bytes())?;
    }
    w.flush()
}

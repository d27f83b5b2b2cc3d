//! Little-endian primitives for the binary model format.

use std::io::{self, Read, Write};

pub(crate) fn write_i32<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn read_i32<R: Read>(r: &mut R) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub(crate) fn write_i64<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn read_i64<R: Read>(r: &mut R) -> io::Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

pub(crate) fn write_f64<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub(crate) fn read_f64<R: Read>(r: &mut R) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

pub(crate) fn write_bool<W: Write>(w: &mut W, v: bool) -> io::Result<()> {
    w.write_all(&[v as u8])
}

pub(crate) fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0] != 0)
}

/// UTF-8 string prefixed with a u32 byte length.
pub(crate) fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_all(&(s.len() as u32).to_le_bytes())?;
    w.write_all(s.as_bytes())
}

pub(crate) fn read_str<R: Read>(r: &mut R) -> io::Result<String> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let len = u32::from_le_bytes(buf) as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

pub(crate) fn write_f32_slice<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    w.write_all(bytemuck::cast_slice::<f32, u8>(values))
}

pub(crate) fn read_f32_vec<R: Read>(r: &mut R, n: usize) -> io::Result<Vec<f32>> {
    let mut values = vec![0.0f32; n];
    r.read_exact(bytemuck::cast_slice_mut::<f32, u8>(&mut values))?;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut buf = Vec::new();
        write_i32(&mut buf, -17).unwrap();
        write_i64(&mut buf, 1 << 40).unwrap();
        write_f64(&mut buf, 1e-4).unwrap();
        write_bool(&mut buf, true).unwrap();
        write_str(&mut buf, "__label__spor").unwrap();
        write_f32_slice(&mut buf, &[0.5, -1.25]).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(read_i32(&mut r).unwrap(), -17);
        assert_eq!(read_i64(&mut r).unwrap(), 1 << 40);
        assert_eq!(read_f64(&mut r).unwrap(), 1e-4);
        assert!(read_bool(&mut r).unwrap());
        assert_eq!(read_str(&mut r).unwrap(), "__label__spor");
        assert_eq!(read_f32_vec(&mut r, 2).unwrap(), vec![0.5, -1.25]);
    }
}

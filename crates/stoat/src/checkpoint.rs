use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use stoat_core::{Backend, DType, Error, Result, Shape, Tensor, WeightTensor};
use stoat_data::Vocab;
use stoat_nn::TaggerConfig;

// Checkpoint — model persistence
//
// Binary format (.stoat):
//
//   Header:
//     magic:    [u8; 4]  = b"STOA"
//     version:  u32 LE   = 1
//     meta_len: u64 LE
//     meta:     [u8; meta_len]   JSON CheckpointMeta
//     count:    u32 LE           number of tensors
//
//   For each tensor:
//     key_len:  u32 LE
//     key:      [u8; key_len]    UTF-8, "module/param.name"
//     dtype:    u8               (0=F32, 1=F64, 2=U32; 5=F16, 6=BF16
//                                 readable for snapshots written by
//                                 half-precision tools)
//     ndim:     u32 LE
//     dims:     [u32 LE; ndim]
//     data_len: u64 LE           bytes
//     data:     [u8; data_len]   raw little-endian values
//
// The meta block carries everything needed to rebuild the network before
// the tensors are poured back in: model hyperparameters, both
// vocabularies, the compute dtype, and the best validation score so far.

const MAGIC: &[u8; 4] = b"STOA";
const VERSION: u32 = 1;

/// Everything the loader needs besides the raw tensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: TaggerConfig,
    pub tokens: Vocab,
    pub labels: Vocab,
    /// Compute dtype tag: "f32" or "f64".
    pub dtype: String,
    pub best_score: f64,
    pub updates: usize,
}

pub fn dtype_tag(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "f32",
        DType::F64 => "f64",
        DType::U32 => "u32",
    }
}

pub fn parse_dtype_tag(tag: &str) -> Result<DType> {
    match tag {
        "f32" => Ok(DType::F32),
        "f64" => Ok(DType::F64),
        "u32" => Ok(DType::U32),
        other => Err(Error::msg(format!("unknown dtype tag {other:?}"))),
    }
}

fn dtype_to_u8(dtype: DType) -> u8 {
    match dtype {
        DType::F32 => 0,
        DType::F64 => 1,
        DType::U32 => 2,
    }
}

// Low-level IO helpers

fn write_u32(w: &mut impl Write, v: u32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u8(r: &mut impl Read) -> std::io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn tensor_to_bytes<B: Backend>(tensor: &Tensor<B>) -> Result<Vec<u8>> {
    let data = tensor.to_f64_vec()?;
    Ok(match tensor.dtype() {
        DType::F32 => data
            .iter()
            .flat_map(|&v| (v as f32).to_le_bytes())
            .collect(),
        DType::F64 => data.iter().flat_map(|&v| v.to_le_bytes()).collect(),
        DType::U32 => data
            .iter()
            .flat_map(|&v| (v as u32).to_le_bytes())
            .collect(),
    })
}

fn bytes_to_f64(bytes: &[u8], tag: u8) -> Result<Vec<f64>> {
    Ok(match tag {
        0 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        1 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
        2 => bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        5 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f64())
            .collect(),
        6 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f64())
            .collect(),
        other => return Err(Error::msg(format!("unknown dtype tag: {other}"))),
    })
}

// Save

/// Write meta + named parameters to a writer.
pub fn write_checkpoint<B: Backend>(
    writer: &mut impl Write,
    meta: &CheckpointMeta,
    params: &[(String, WeightTensor<B>)],
) -> Result<()> {
    writer.write_all(MAGIC)?;
    write_u32(writer, VERSION)?;
    let meta_json =
        serde_json::to_vec(meta).map_err(|e| Error::msg(format!("meta encode: {e}")))?;
    write_u64(writer, meta_json.len() as u64)?;
    writer.write_all(&meta_json)?;
    write_u32(writer, params.len() as u32)?;

    for (key, param) in params {
        let tensor = param.weight();
        write_u32(writer, key.len() as u32)?;
        writer.write_all(key.as_bytes())?;
        writer.write_all(&[dtype_to_u8(tensor.dtype())])?;
        write_u32(writer, tensor.rank() as u32)?;
        for &d in tensor.dims() {
            write_u32(writer, d as u32)?;
        }
        let bytes = tensor_to_bytes(tensor)?;
        write_u64(writer, bytes.len() as u64)?;
        writer.write_all(&bytes)?;
    }
    Ok(())
}

/// Save to a file path.
pub fn save<B: Backend>(
    path: impl AsRef<Path>,
    meta: &CheckpointMeta,
    params: &[(String, WeightTensor<B>)],
) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_checkpoint::<B>(&mut writer, meta, params)?;
    writer.flush()?;
    Ok(())
}

// Load

/// One raw tensor record from a checkpoint.
pub struct TensorRecord {
    pub key: String,
    pub dims: Vec<usize>,
    pub data: Vec<f64>,
}

/// Read meta + all tensor records from a reader.
pub fn read_checkpoint(reader: &mut impl Read) -> Result<(CheckpointMeta, Vec<TensorRecord>)> {
    let magic = read_bytes(reader, 4)?;
    if magic != MAGIC {
        return Err(Error::msg("not a stoat checkpoint (bad magic)"));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::msg(format!("unsupported checkpoint version {version}")));
    }
    let meta_len = read_u64(reader)? as usize;
    let meta_json = read_bytes(reader, meta_len)?;
    let mut meta: CheckpointMeta = serde_json::from_slice(&meta_json)
        .map_err(|e| Error::msg(format!("meta decode: {e}")))?;
    meta.tokens.rebuild_index();
    meta.labels.rebuild_index();

    let count = read_u32(reader)? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = read_u32(reader)? as usize;
        let key = String::from_utf8(read_bytes(reader, key_len)?)
            .map_err(|e| Error::msg(format!("bad tensor key: {e}")))?;
        let tag = read_u8(reader)?;
        let ndim = read_u32(reader)? as usize;
        let mut dims = Vec::with_capacity(ndim);
        for _ in 0..ndim {
            dims.push(read_u32(reader)? as usize);
        }
        let data_len = read_u64(reader)? as usize;
        let bytes = read_bytes(reader, data_len)?;
        records.push(TensorRecord {
            key,
            dims,
            data: bytes_to_f64(&bytes, tag)?,
        });
    }
    Ok((meta, records))
}

/// Load from a file path.
pub fn load(path: impl AsRef<Path>) -> Result<(CheckpointMeta, Vec<TensorRecord>)> {
    let mut reader = BufReader::new(File::open(path)?);
    read_checkpoint(&mut reader)
}

/// Pour checkpoint records into live parameters, matched by key. Every
/// parameter must find its record with a matching shape; extra records in
/// the file are ignored.
pub fn restore_params<B: Backend>(
    records: &[TensorRecord],
    params: &[(String, WeightTensor<B>)],
) -> Result<()> {
    for (key, param) in params {
        let record = records
            .iter()
            .find(|r| r.key == *key)
            .ok_or_else(|| Error::msg(format!("checkpoint is missing parameter {key:?}")))?;
        let expected = param.weight().shape().clone();
        if Shape::new(record.dims.clone()) != expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: Shape::new(record.dims.clone()),
            });
        }
        param.weight().update_data_inplace(&record.data)?;
    }
    Ok(())
}

use crate::cluster::Cluster;
use crate::core::TaskError;
use crate::store::{Key, Value};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The key holding the next free vector number of a group.
pub(crate) fn vec_counter(group: u64) -> Key {
  Key::vec(group, u32::MAX)
}

/// One column of a [`Frame`]. The layout lists the first row of every chunk, followed by the
/// total row count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vector {
  group: u64,
  index: u32,
  espc: Arc<[u64]>,
}
impl Vector {
  pub fn new(group: u64, index: u32, espc: Vec<u64>) -> Vector {
    Vector {
      group: group,
      index: index,
      espc: espc.into(),
    }
  }

  pub fn group(&self) -> u64 {
    self.group
  }

  pub fn index(&self) -> u32 {
    self.index
  }

  pub fn num_chunks(&self) -> u32 {
    self.espc.len().saturating_sub(1) as u32
  }

  pub fn num_rows(&self) -> u64 {
    self.espc.last().copied().unwrap_or(0)
  }

  pub fn chunk_start(&self, cidx: u32) -> u64 {
    self.espc[cidx as usize]
  }

  pub fn chunk_rows(&self, cidx: u32) -> u64 {
    self.espc[cidx as usize + 1] - self.espc[cidx as usize]
  }

  pub fn chunk_key(&self, cidx: u32) -> Key {
    Key::chunk(self.group, self.index, cidx)
  }

  /// Whether `other` splits its rows into the same chunks.
  pub fn same_layout(&self, other: &Vector) -> bool {
    self.group == other.group && self.espc == other.espc
  }

  /// Reads chunk `cidx`, from its home if it is not stored here.
  pub fn chunk(&self, cluster: &Cluster, cidx: u32) -> Result<Chunk, TaskError> {
    let start = self.chunk_start(cidx);
    if self.chunk_rows(cidx) == 0 {
      return Ok(Chunk::new(cidx, start, Vec::new()));
    }
    let value = cluster
      .get_remote(&self.chunk_key(cidx))?
      .ok_or(TaskError::MissingChunk {
        group: self.group,
        vec: self.index,
        cidx: cidx,
      })?;
    Ok(Chunk::new(cidx, start, value.get()?))
  }

  /// Reads every chunk, in order.
  pub fn to_vec(&self, cluster: &Cluster) -> Result<Vec<f64>, TaskError> {
    let mut out = Vec::with_capacity(self.num_rows() as usize);
    for cidx in 0..self.num_chunks() {
      out.extend_from_slice(self.chunk(cluster, cidx)?.values());
    }
    Ok(out)
  }
}

/// The rows of one vector that fall in one chunk.
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk {
  cidx: u32,
  start: u64,
  values: Vec<f64>,
}
impl Chunk {
  pub fn new(cidx: u32, start: u64, values: Vec<f64>) -> Chunk {
    Chunk {
      cidx: cidx,
      start: start,
      values: values,
    }
  }

  pub fn cidx(&self) -> u32 {
    self.cidx
  }

  /// The row number of the first value, within the whole vector.
  pub fn start(&self) -> u64 {
    self.start
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn at(&self, row: usize) -> f64 {
    self.values[row]
  }

  pub fn values(&self) -> &[f64] {
    &self.values[..]
  }
}

/// An output chunk being written by a map call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewChunk {
  cidx: u32,
  values: Vec<f64>,
}
impl NewChunk {
  pub fn new(cidx: u32) -> NewChunk {
    NewChunk {
      cidx: cidx,
      values: Vec::new(),
    }
  }

  pub fn cidx(&self) -> u32 {
    self.cidx
  }

  pub fn add_num(&mut self, v: f64) {
    self.values.push(v);
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub(crate) fn into_values(self) -> Vec<f64> {
    self.values
  }
}

/// Collects the row counts of an output vector while its chunks are written on many nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendableVec {
  index: u32,
  rows: Vec<u64>,
}
impl AppendableVec {
  pub fn new(index: u32, num_chunks: u32) -> AppendableVec {
    AppendableVec {
      index: index,
      rows: vec![0; num_chunks as usize],
    }
  }

  pub fn index(&self) -> u32 {
    self.index
  }

  pub(crate) fn set_rows(&mut self, cidx: u32, rows: u64) {
    self.rows[cidx as usize] = rows;
  }

  /// Folds in the chunks written elsewhere. Each chunk is written once, so counts add.
  pub fn merge(&mut self, other: &AppendableVec) {
    for (a, b) in self.rows.iter_mut().zip(other.rows.iter()) {
      *a += *b;
    }
  }

  /// The finished vector, in `group`.
  pub fn close(&self, group: u64) -> Vector {
    let mut espc = Vec::with_capacity(self.rows.len() + 1);
    let mut total = 0;
    espc.push(0);
    for r in self.rows.iter() {
      total += *r;
      espc.push(total);
    }
    Vector::new(group, self.index, espc)
  }
}

/// Named columns that share a group and a chunk layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
  names: Vec<String>,
  vecs: Vec<Vector>,
}
impl Frame {
  pub fn new(names: Vec<String>, vecs: Vec<Vector>) -> Result<Frame, TaskError> {
    if names.len() != vecs.len() {
      return Err(TaskError::IncompatibleFrame(format!(
        "{} names for {} vectors",
        names.len(),
        vecs.len()
      )));
    }
    Frame::check_compatible(&vecs[..])?;
    Ok(Frame {
      names: names,
      vecs: vecs,
    })
  }

  /// Rejects vectors that are not all in one group with one chunk layout.
  pub fn check_compatible(vecs: &[Vector]) -> Result<(), TaskError> {
    let first = vecs
      .first()
      .ok_or_else(|| TaskError::IncompatibleFrame("a frame needs a vector".to_string()))?;
    match vecs.iter().find(|v| !v.same_layout(first)) {
      Some(v) => Err(TaskError::IncompatibleFrame(format!(
        "vector {} of group {:#018x} does not match vector {} of group {:#018x}",
        v.index, v.group, first.index, first.group
      ))),
      None => Ok(()),
    }
  }

  /// Splits `columns` into chunks of `chunk_rows` rows and stores every chunk at its home.
  pub fn create(
    cluster: &Cluster,
    names: &[&str],
    columns: &[Vec<f64>],
    chunk_rows: usize,
  ) -> Result<Frame, TaskError> {
    let rows = columns.first().map_or(0, |c| c.len());
    if chunk_rows == 0 || columns.iter().any(|c| c.len() != rows) {
      return Err(TaskError::IncompatibleFrame(
        "columns must have equal lengths and chunks at least one row".to_string(),
      ));
    }
    let group = rand::random::<u64>();
    let espc = (0..rows)
      .step_by(chunk_rows)
      .map(|r| r as u64)
      .chain(std::iter::once(rows as u64))
      .collect_vec();
    let vecs = (0..columns.len())
      .map(|i| Vector::new(group, i as u32, espc.clone()))
      .collect_vec();
    let frame = Frame::new(names.iter().map(|n| n.to_string()).collect(), vecs)?;
    cluster.put_home(
      &vec_counter(group),
      Value::from_object(&(columns.len() as u32))?,
    )?;
    for (vec, column) in frame.vecs.iter().zip(columns.iter()) {
      for cidx in 0..vec.num_chunks() {
        let lo = vec.chunk_start(cidx) as usize;
        let hi = lo + vec.chunk_rows(cidx) as usize;
        cluster.put_home(&vec.chunk_key(cidx), Value::from_object(&column[lo..hi])?)?;
      }
    }
    Ok(frame)
  }

  pub fn names(&self) -> &[String] {
    &self.names[..]
  }

  pub fn vecs(&self) -> &[Vector] {
    &self.vecs[..]
  }

  pub fn vec(&self, i: usize) -> &Vector {
    &self.vecs[i]
  }

  pub fn num_cols(&self) -> usize {
    self.vecs.len()
  }

  pub fn num_rows(&self) -> u64 {
    self.vecs[0].num_rows()
  }

  pub fn num_chunks(&self) -> u32 {
    self.vecs[0].num_chunks()
  }

  pub fn group(&self) -> u64 {
    self.vecs[0].group()
  }

  /// Reads column `i` back in full.
  pub fn column(&self, cluster: &Cluster, i: usize) -> Result<Vec<f64>, TaskError> {
    self.vecs[i].to_vec(cluster)
  }

  /// Removes every chunk of the frame from its home.
  pub fn remove(&self, cluster: &Cluster) -> Result<(), TaskError> {
    for vec in self.vecs.iter() {
      for cidx in 0..vec.num_chunks() {
        cluster.remove_home(&vec.chunk_key(cidx))?;
      }
    }
    Ok(())
  }
}

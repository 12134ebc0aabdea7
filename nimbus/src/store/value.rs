use crate::core::{deserialize, serialize, TaskError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// An immutable stored value: opaque bytes and a version counter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
  bytes: Vec<u8>,
  version: u64,
}
impl Value {
  pub fn new(bytes: Vec<u8>) -> Value {
    Value {
      bytes: bytes,
      version: 0,
    }
  }

  /// Encodes `obj` as the value's bytes.
  pub fn from_object<T: Serialize + ?Sized>(obj: &T) -> Result<Value, TaskError> {
    Ok(Value::new(serialize(&obj)?))
  }

  /// Decodes the value's bytes.
  pub fn get<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
    deserialize(&self.bytes[..])
  }

  /// A new value replacing `old`, one version later.
  pub fn successor(old: Option<&Value>, bytes: Vec<u8>) -> Value {
    Value {
      bytes: bytes,
      version: old.map_or(0, |v| v.version + 1),
    }
  }

  pub fn bytes(&self) -> &[u8] {
    &self.bytes[..]
  }

  pub fn version(&self) -> u64 {
    self.version
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }
}

#[test]
fn test_versions() {
  let v0 = Value::from_object(&5u64).unwrap();
  assert_eq!(v0.get::<u64>().unwrap(), 5);
  let v1 = Value::successor(Some(&v0), serialize(&6u64).unwrap());
  assert_eq!(v1.version(), 1);
  assert_eq!(Value::successor(None, vec![]).version(), 0);
  assert!(v1.get::<String>().is_err());
}

#[test]
fn test_unsized_objects() {
  let column = [1.5f64, 2.5, 4.0, 8.0];
  let v = Value::from_object(&column[1..3]).unwrap();
  assert_eq!(v.get::<Vec<f64>>().unwrap(), vec![2.5, 4.0]);
  let s = Value::from_object("chunk").unwrap();
  assert_eq!(v.version(), 0);
  assert_eq!(s.get::<String>().unwrap(), "chunk");
}

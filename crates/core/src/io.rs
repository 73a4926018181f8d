//! Safetensors encoding for named tensors

use std::borrow::Cow;
use std::collections::HashMap;
use std::path::Path;

use safetensors::tensor::View;
use safetensors::SafeTensors;

use crate::error::{CoreError, Result};
use crate::tensor::{DType, Tensor};

/// Borrowed view handed to the safetensors serializer
pub struct TensorRef<'a>(pub &'a Tensor);

impl View for TensorRef<'_> {
    fn dtype(&self) -> safetensors::Dtype {
        self.0.dtype().into()
    }

    fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(self.0.as_bytes())
    }

    fn data_len(&self) -> usize {
        self.0.size_bytes()
    }
}

/// Write named tensors to a single safetensors file
pub fn write_safetensors<'a, I>(
    tensors: I,
    metadata: Option<HashMap<String, String>>,
    path: &Path,
) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a Tensor)>,
{
    let views: Vec<(&str, TensorRef<'_>)> = tensors
        .into_iter()
        .map(|(name, tensor)| (name, TensorRef(tensor)))
        .collect();
    safetensors::serialize_to_file(views, &metadata, path)
        .map_err(|e| CoreError::Safetensors(e.to_string()))
}

/// Decode every tensor of a safetensors buffer, sorted by name
pub fn read_safetensors(bytes: &[u8]) -> Result<Vec<(String, Tensor)>> {
    let tensors =
        SafeTensors::deserialize(bytes).map_err(|e| CoreError::Safetensors(e.to_string()))?;

    let mut out: Vec<(String, Tensor)> = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let dtype = DType::try_from(view.dtype())?;
            let tensor = Tensor::from_bytes(view.shape().to_vec(), dtype, view.data().to_vec())?;
            Ok((name, tensor))
        })
        .collect::<Result<_>>()?;
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");

        let a = Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = Tensor::from_i32(vec![1], &[7]).unwrap();
        let metadata = HashMap::from([("format".to_string(), "pt".to_string())]);
        write_safetensors([("b", &b), ("a", &a)], Some(metadata), &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let tensors = read_safetensors(&bytes).unwrap();
        assert_eq!(tensors.len(), 2);
        assert_eq!(tensors[0], ("a".to_string(), a));
        assert_eq!(tensors[1], ("b".to_string(), b));
        let (_, header) = SafeTensors::read_metadata(&bytes).unwrap();
        assert_eq!(header.metadata().as_ref().unwrap()["format"], "pt");
    }
}

//! Moves `[time, batch, class]` tensors to host frames and back.

use candle_core::{DType, Device, Tensor};

use crate::error::{tensor_err, LossError};

pub type Frames = Vec<Vec<Vec<f32>>>;

pub fn to_frames(tensor: &Tensor) -> Result<Frames, LossError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.to_vec3::<f32>())
        .map_err(tensor_err("tensor to host frames"))
}

pub fn from_frames(frames: &Frames, device: &Device) -> Result<Tensor, LossError> {
    let time = frames.len();
    let batch = frames.first().map_or(0, Vec::len);
    let classes = frames
        .first()
        .and_then(|frame| frame.first())
        .map_or(0, Vec::len);
    let data: Vec<f32> = frames.iter().flatten().flatten().copied().collect();
    if data.len() != time * batch * classes {
        return Err(LossError::shape(
            "host frames",
            format!("ragged frames for a {time}x{batch}x{classes} tensor"),
        ));
    }
    Tensor::from_vec(data, (time, batch, classes), device).map_err(tensor_err("host frames to tensor"))
}

pub fn zeros_like_frames(time: usize, batch: usize, classes: usize) -> Frames {
    vec![vec![vec![0.0; classes]; batch]; time]
}

pub fn vector_to_host(tensor: &Tensor) -> Result<Vec<f32>, LossError> {
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(tensor_err("vector to host"))
}

/// `[time, batch, class]` dims of a score tensor.
pub fn dims3(tensor: &Tensor, context: &'static str) -> Result<(usize, usize, usize), LossError> {
    tensor
        .dims3()
        .map_err(|e| LossError::shape(context, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_a_tensor() {
        let frames: Frames = vec![
            vec![vec![0.1, 0.9], vec![0.5, 0.5]],
            vec![vec![0.7, 0.3], vec![0.2, 0.8]],
        ];
        let tensor = from_frames(&frames, &Device::Cpu).expect("tensor");
        assert_eq!(dims3(&tensor, "test").expect("dims"), (2, 2, 2));
        assert_eq!(to_frames(&tensor).expect("frames"), frames);
    }

    #[test]
    fn ragged_frames_are_rejected() {
        let frames: Frames = vec![vec![vec![0.1, 0.9]], vec![vec![0.7]]];
        assert!(from_frames(&frames, &Device::Cpu).is_err());
    }
}

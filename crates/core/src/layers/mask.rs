use candle_core::{DType, Device, Result, Tensor};

/// Boolean causal mask, `1` where query `i` may attend to key `j`.
///
/// Returns shape `[seq_len, seq_len + seqlen_offset]`; key `j` is excluded
/// when `j > i + seqlen_offset`.
pub fn causal_mask(seq_len: usize, seqlen_offset: usize, device: &Device) -> Result<Tensor> {
    let total_len = seq_len + seqlen_offset;
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..total_len).map(move |j| u8::from(j <= i + seqlen_offset)))
        .collect();
    Tensor::from_vec(mask, (seq_len, total_len), device)
}

/// Block-causal mask over `frames * tokens_per_frame` tokens laid out frame-major.
///
/// Every token of frame `i` may attend to every token of frame `j` iff `j <= i`.
pub fn frame_causal_mask(
    frames: usize,
    tokens_per_frame: usize,
    device: &Device,
) -> Result<Tensor> {
    let n = frames * tokens_per_frame;
    let mask: Vec<u8> = (0..n)
        .flat_map(|i| {
            let frame = i / tokens_per_frame;
            (0..n).map(move |j| u8::from(j / tokens_per_frame <= frame))
        })
        .collect();
    Tensor::from_vec(mask, (n, n), device)
}

/// Keep `xs` where `mask` is non-zero, fill the rest with `-f32::MAX`.
///
/// `mask` broadcasts against `xs`.
pub fn masked_fill(xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let mask = match mask.dtype() {
        DType::U8 => mask.broadcast_as(xs.shape())?,
        _ => mask.ne(0f64)?.broadcast_as(xs.shape())?,
    };
    let fill = Tensor::full(f32::MIN, xs.shape(), xs.device())?.to_dtype(xs.dtype())?;
    mask.where_cond(xs, &fill)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_is_lower_triangular() {
        let mask = causal_mask(3, 0, &Device::Cpu).unwrap();
        assert_eq!(
            mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]
        );
    }

    #[test]
    fn causal_mask_with_offset_sees_prefix() {
        let mask = causal_mask(2, 2, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[2, 4]);
        assert_eq!(
            mask.to_vec2::<u8>().unwrap(),
            vec![vec![1, 1, 1, 0], vec![1, 1, 1, 1]]
        );
    }

    #[test]
    fn frame_causal_mask_groups_tokens() {
        let mask = frame_causal_mask(2, 2, &Device::Cpu).unwrap();
        assert_eq!(
            mask.to_vec2::<u8>().unwrap(),
            vec![
                vec![1, 1, 0, 0],
                vec![1, 1, 0, 0],
                vec![1, 1, 1, 1],
                vec![1, 1, 1, 1],
            ]
        );
    }

    #[test]
    fn masked_fill_uses_most_negative_finite() {
        let device = Device::Cpu;
        let xs = Tensor::new(&[[1f32, 2.], [3., 4.]], &device).unwrap();
        let mask = Tensor::new(&[1u8, 0], &device).unwrap();
        let out = masked_fill(&xs, &mask).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out, vec![vec![1.0, f32::MIN], vec![3.0, f32::MIN]]);

        // softmax over a fully masked row stays finite
        let none = Tensor::zeros((2, 2), DType::U8, &device).unwrap();
        let probs = candle_nn::ops::softmax_last_dim(&masked_fill(&xs, &none).unwrap())
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert!(probs.iter().flatten().all(|p| p.is_finite()));
    }
}

//! Distance metrics over raw or decoded vectors.

use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::types::{HnswError, Result};

/// Similarity measure used to order neighbors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Squared Euclidean distance.
    #[default]
    L2sq,
    /// One minus cosine similarity.
    Cosine,
    /// Negated inner product.
    InnerProduct,
}

impl Metric {
    /// On-disk tag.
    pub const fn as_u8(self) -> u8 {
        match self {
            Metric::L2sq => 1,
            Metric::Cosine => 2,
            Metric::InnerProduct => 3,
        }
    }

    /// Name used in configuration files.
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::L2sq => "l2sq",
            Metric::Cosine => "cosine",
            Metric::InnerProduct => "inner_product",
        }
    }

    /// Distance between `query` and a stored vector given component-wise.
    /// Smaller is closer for every metric.
    pub fn distance<I>(self, query: &[f32], stored: I) -> f32
    where
        I: IntoIterator<Item = f32>,
    {
        match self {
            Metric::L2sq => query
                .iter()
                .zip(stored)
                .map(|(a, b)| (a - b) * (a - b))
                .sum(),
            Metric::InnerProduct => {
                -query.iter().zip(stored).map(|(a, b)| a * b).sum::<f32>()
            }
            Metric::Cosine => {
                let (mut dot, mut qq, mut ss) = (0f32, 0f32, 0f32);
                for (a, b) in query.iter().zip(stored) {
                    dot += a * b;
                    qq += a * a;
                    ss += b * b;
                }
                if qq == 0.0 || ss == 0.0 {
                    1.0
                } else {
                    1.0 - dot / (qq.sqrt() * ss.sqrt())
                }
            }
        }
    }
}

impl TryFrom<u8> for Metric {
    type Error = HnswError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Metric::L2sq),
            2 => Ok(Metric::Cosine),
            3 => Ok(Metric::InnerProduct),
            _ => Err(HnswError::CorruptHeader("unknown metric tag")),
        }
    }
}

impl std::str::FromStr for Metric {
    type Err = HnswError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "l2sq" | "l2" => Ok(Metric::L2sq),
            "cosine" | "cos" => Ok(Metric::Cosine),
            "inner_product" | "ip" => Ok(Metric::InnerProduct),
            _ => Err(HnswError::Invalid("unknown metric")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_order_closer_vectors_first() {
        let q = [1.0, 0.0];
        for metric in [Metric::L2sq, Metric::Cosine, Metric::InnerProduct] {
            let near = metric.distance(&q, [0.9, 0.1]);
            let far = metric.distance(&q, [-1.0, 0.0]);
            assert!(near < far, "{metric:?}");
        }
    }

    #[test]
    fn tags_roundtrip() {
        for metric in [Metric::L2sq, Metric::Cosine, Metric::InnerProduct] {
            assert_eq!(Metric::try_from(metric.as_u8()).unwrap(), metric);
            assert_eq!(metric.as_str().parse::<Metric>().unwrap(), metric);
        }
        assert!(Metric::try_from(0).is_err());
    }

    #[test]
    fn cosine_of_zero_vector_is_maximal() {
        assert_eq!(Metric::Cosine.distance(&[0.0, 0.0], [1.0, 1.0]), 1.0);
    }
}

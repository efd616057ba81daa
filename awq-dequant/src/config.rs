use serde::{Deserialize, Deserializer, Serialize};

/// Packing layout of the quantized linear weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AwqVersion {
    #[default]
    Gemm,
}

/// The `quantization_config` block of an AWQ checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwqConfig {
    pub quant_method: String,
    pub bits: usize,
    pub group_size: i64,
    pub zero_point: bool,
    pub version: AwqVersion,
}

#[derive(Deserialize)]
struct RawAwqConfig {
    quant_method: Option<String>,
    bits: Option<usize>,
    group_size: Option<i64>,
    zero_point: Option<bool>,
    version: Option<AwqVersion>,
}

impl<'de> Deserialize<'de> for AwqConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = RawAwqConfig::deserialize(deserializer)?;

        match &raw.quant_method {
            Some(m) if m == "awq" => {}
            Some(unknown_method) => {
                return Err(serde::de::Error::custom(format!(
                    "Unknown quantization method `{unknown_method}`, expected `awq`."
                )))
            }
            None => {}
        }
        let bits = raw
            .bits
            .ok_or_else(|| serde::de::Error::missing_field("bits"))?;
        if bits != 4 {
            return Err(serde::de::Error::custom(format!(
                "AWQ dequantize supports 4-bit weights, got {bits} bits."
            )));
        }
        let group_size = raw
            .group_size
            .ok_or_else(|| serde::de::Error::missing_field("group_size"))?;
        let zero_point = raw.zero_point.unwrap_or(true);
        if !zero_point {
            return Err(serde::de::Error::custom(
                "AWQ dequantize requires `zero_point: true`.",
            ));
        }

        Ok(AwqConfig {
            quant_method: "awq".to_string(),
            bits,
            group_size,
            zero_point,
            version: raw.version.unwrap_or_default(),
        })
    }
}

impl AwqConfig {
    /// Group size as passed to descriptor creation, which validates it.
    pub fn group_size(&self) -> i64 {
        self.group_size
    }
}

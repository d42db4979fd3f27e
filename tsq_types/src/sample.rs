use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

/// Group type shared by every numeric data type.
pub const GROUP_NUMBER: &str = "number";
/// Group type of text data.
pub const GROUP_TEXT: &str = "text";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown data type: {0}")]
pub struct UnknownDataType(pub String);

/// The declared type of a row, fixed for every sample in that row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Long,
    Double,
    Text,
}

impl DataType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Double => "double",
            Self::Text => "text",
        }
    }

    /// The group type aggregators are matched against.
    pub const fn group_type(&self) -> &'static str {
        match self {
            Self::Long | Self::Double => GROUP_NUMBER,
            Self::Text => GROUP_TEXT,
        }
    }
}

impl FromStr for DataType {
    type Err = UnknownDataType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(Self::Long),
            "double" => Ok(Self::Double),
            "text" => Ok(Self::Text),
            other => Err(UnknownDataType(other.to_string())),
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleValue {
    Long(i64),
    Double(f64),
    Text(Arc<str>),
}

impl SampleValue {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Long(_) => DataType::Long,
            Self::Double(_) => DataType::Double,
            Self::Text(_) => DataType::Text,
        }
    }

    /// Numeric view of the value, `None` for text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Long(v) => Some(*v as f64),
            Self::Double(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

impl From<i64> for SampleValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<f64> for SampleValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for SampleValue {
    fn from(value: &str) -> Self {
        Self::Text(Arc::from(value))
    }
}

impl Display for SampleValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "{v}"),
        }
    }
}

/// A single timestamped value. Timestamps are milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: i64,
    pub value: SampleValue,
}

impl Sample {
    pub fn new(timestamp: i64, value: impl Into<SampleValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.value.data_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_type_round_trips_through_str() {
        for data_type in [DataType::Long, DataType::Double, DataType::Text] {
            assert_eq!(data_type.as_str().parse::<DataType>().unwrap(), data_type);
        }
        assert_eq!(
            "histogram".parse::<DataType>().unwrap_err(),
            UnknownDataType("histogram".to_string())
        );
    }

    #[test]
    fn numeric_types_share_a_group_type() {
        assert_eq!(DataType::Long.group_type(), GROUP_NUMBER);
        assert_eq!(DataType::Double.group_type(), GROUP_NUMBER);
        assert_eq!(DataType::Text.group_type(), GROUP_TEXT);
    }

    #[test]
    fn sample_value_conversions() {
        assert_eq!(Sample::new(1, 5i64).data_type(), DataType::Long);
        assert_eq!(Sample::new(1, 0.5).value.as_f64(), Some(0.5));
        assert_eq!(Sample::new(1, "up").value.as_f64(), None);
    }
}

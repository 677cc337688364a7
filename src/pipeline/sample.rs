//! Samples produced by one poll

use crate::transport::UserProperties;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single named value read from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPoint {
    pub tag_name: String,
    pub value: serde_json::Value,
}

impl DataPoint {
    pub fn new(tag_name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            tag_name: tag_name.into(),
            value: value.into(),
        }
    }
}

/// Result of one poll: zero or more data points taken at the same time
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub data_points: Vec<DataPoint>,
    /// Extra user properties added by the adapter for this sample only
    pub user_properties: UserProperties,
}

impl Sample {
    /// Sample taken now
    pub fn new(data_points: Vec<DataPoint>) -> Self {
        Self::at(Utc::now(), data_points)
    }

    pub fn at(timestamp: DateTime<Utc>, data_points: Vec<DataPoint>) -> Self {
        Self {
            timestamp,
            data_points,
            user_properties: Vec::new(),
        }
    }

    pub fn with_user_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((name.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.data_points.is_empty()
    }
}

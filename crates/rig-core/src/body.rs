//! Request body producers.
//!
//! A producer is evaluated once per request and shared by every virtual
//! user, so implementations must be safe to call concurrently.

use crate::error::ConfigError;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Body of one outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Bytes {
        content_type: Option<String>,
        data: Vec<u8>,
    },
    /// A single file part of a `multipart/form-data` request. Cloning `data`
    /// shares the buffer.
    Multipart {
        field: String,
        file_name: String,
        content_type: String,
        data: Bytes,
    },
}

pub trait BodyProducer: Send + Sync {
    fn produce(&self) -> RequestBody;
}

/// No body at all.
pub struct EmptyBody;

impl BodyProducer for EmptyBody {
    fn produce(&self) -> RequestBody {
        RequestBody::Empty
    }
}

/// The same bytes on every request.
pub struct StaticBody {
    content_type: Option<String>,
    data: Vec<u8>,
}

impl StaticBody {
    pub fn new(content_type: Option<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type,
            data: data.into(),
        }
    }
}

impl BodyProducer for StaticBody {
    fn produce(&self) -> RequestBody {
        RequestBody::Bytes {
            content_type: self.content_type.clone(),
            data: self.data.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NumericRange {
    pub min: f64,
    pub max: f64,
    /// Digits kept after the decimal point; 0 yields integers.
    #[serde(default)]
    pub decimals: u32,
}

impl NumericRange {
    fn sample(&self, rng: &mut StdRng) -> Value {
        let raw = if self.max > self.min {
            rng.gen_range(self.min..=self.max)
        } else {
            self.min
        };
        if self.decimals == 0 {
            return Value::from(raw.round() as i64);
        }
        let scale = 10f64.powi(self.decimals as i32);
        Value::from((raw * scale).round() / scale)
    }
}

/// JSON object built from a fixed template, with some fields drawn at random
/// on every request: either one item of a list or a number from a range.
pub struct RandomJsonBody {
    template: Map<String, Value>,
    choices: Vec<(String, Vec<Value>)>,
    ranges: Vec<(String, NumericRange)>,
    rng: Mutex<StdRng>,
}

impl RandomJsonBody {
    pub fn new(
        template: Map<String, Value>,
        choices: BTreeMap<String, Vec<Value>>,
        ranges: BTreeMap<String, NumericRange>,
        seed: Option<u64>,
    ) -> Result<Self, ConfigError> {
        if let Some((field, _)) = choices.iter().find(|(_, items)| items.is_empty()) {
            return Err(ConfigError::InvalidBody(format!(
                "choice list for '{field}' is empty"
            )));
        }
        if let Some((field, _)) = ranges
            .iter()
            .find(|(_, r)| !r.min.is_finite() || !r.max.is_finite() || r.min > r.max)
        {
            return Err(ConfigError::InvalidBody(format!(
                "range for '{field}' must have finite min <= max"
            )));
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            template,
            choices: choices.into_iter().collect(),
            ranges: ranges.into_iter().collect(),
            rng: Mutex::new(rng),
        })
    }

    fn render(&self) -> Value {
        let mut object = self.template.clone();
        let mut rng = self.rng.lock();
        for (field, items) in &self.choices {
            if let Some(item) = items.choose(&mut *rng) {
                object.insert(field.clone(), item.clone());
            }
        }
        for (field, range) in &self.ranges {
            object.insert(field.clone(), range.sample(&mut rng));
        }
        Value::Object(object)
    }
}

impl BodyProducer for RandomJsonBody {
    fn produce(&self) -> RequestBody {
        RequestBody::Bytes {
            content_type: Some("application/json".to_string()),
            data: self.render().to_string().into_bytes(),
        }
    }
}

/// Uploads the same file on every request. The file is read once.
pub struct MultipartFileBody {
    field: String,
    file_name: String,
    content_type: String,
    data: Bytes,
}

impl MultipartFileBody {
    pub fn new(
        field: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<Self, ConfigError> {
        let content_type = content_type.into();
        reqwest::multipart::Part::bytes(Vec::new())
            .mime_str(&content_type)
            .map_err(|_| {
                ConfigError::InvalidBody(format!("invalid multipart content type '{content_type}'"))
            })?;

        Ok(Self {
            field: field.into(),
            file_name: file_name.into(),
            content_type,
            data: Bytes::from(data),
        })
    }
}

impl BodyProducer for MultipartFileBody {
    fn produce(&self) -> RequestBody {
        RequestBody::Multipart {
            field: self.field.clone(),
            file_name: self.file_name.clone(),
            content_type: self.content_type.clone(),
            data: self.data.clone(),
        }
    }
}

fn default_field() -> String {
    "file".to_string()
}

fn default_octet_stream() -> String {
    "application/octet-stream".to_string()
}

/// Declarative form of a body producer, as written in a scenario file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyConfig {
    Text {
        content: String,
        #[serde(default)]
        content_type: Option<String>,
    },
    Json {
        value: Value,
    },
    RandomJson {
        #[serde(default)]
        template: Map<String, Value>,
        #[serde(default)]
        choices: BTreeMap<String, Vec<Value>>,
        #[serde(default)]
        ranges: BTreeMap<String, NumericRange>,
    },
    MultipartFile {
        path: PathBuf,
        #[serde(default = "default_field")]
        field: String,
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default = "default_octet_stream")]
        content_type: String,
    },
}

impl BodyConfig {
    pub fn build(&self, seed: Option<u64>) -> Result<Arc<dyn BodyProducer>, ConfigError> {
        let producer: Arc<dyn BodyProducer> = match self {
            BodyConfig::Text {
                content,
                content_type,
            } => Arc::new(StaticBody::new(
                Some(
                    content_type
                        .clone()
                        .unwrap_or_else(|| "text/plain".to_string()),
                ),
                content.as_bytes(),
            )),
            BodyConfig::Json { value } => Arc::new(StaticBody::new(
                Some("application/json".to_string()),
                value.to_string(),
            )),
            BodyConfig::RandomJson {
                template,
                choices,
                ranges,
            } => Arc::new(RandomJsonBody::new(
                template.clone(),
                choices.clone(),
                ranges.clone(),
                seed,
            )?),
            BodyConfig::MultipartFile {
                path,
                field,
                file_name,
                content_type,
            } => {
                let data = std::fs::read(path).map_err(|e| {
                    ConfigError::InvalidBody(format!("cannot read upload file {path:?}: {e}"))
                })?;
                let file_name = file_name.clone().unwrap_or_else(|| {
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| "upload.bin".to_string())
                });
                Arc::new(MultipartFileBody::new(
                    field.clone(),
                    file_name,
                    content_type.clone(),
                    data,
                )?)
            }
        };
        Ok(producer)
    }
}

//! Request and response bodies of the persona service.
//!
//! Field names follow the JSON wire format (`camelCase`, except the dataset
//! document which keeps `created_at` and `data_type`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::storage::{DataType, KeyValuePair};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionKey {
    pub version: String,
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionKeyValue {
    pub version: String,
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchSetValueReq {
    pub keys: Vec<VersionKeyValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSetValueResp {
    pub success_keys: Vec<String>,
    pub fail_keys: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BatchGetValueReq {
    pub keys: Vec<VersionKey>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchGetValueResp {
    pub result: HashMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneValueReq {
    pub key: VersionKey,
    pub new_key: VersionKey,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDataReq {
    pub app_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDataResp {
    pub app_data: Vec<KeyValuePair>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportDataReq {
    pub app_data: Vec<KeyValuePair>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateDataSetReq {
    pub name: String,
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateDataSetResp {
    pub id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateDataSetReq {
    pub id: String,
    pub name: String,
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub content: String,
}

/// Dataset filter. Empty strings and a zero type are treated as absent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetByConditionSetReq {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetByConditionSetResp {
    pub list: Vec<DataSetVo>,
}

/// A dataset as returned to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetVo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "type", default)]
    pub kind: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: i64,
}

/// A dataset as stored in the document index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSet {
    pub id: String,
    pub name: String,
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: i64,
    pub content: String,
    pub created_at: i64,
    pub data_type: DataType,
}

impl From<DataSet> for DataSetVo {
    fn from(dataset: DataSet) -> Self {
        Self {
            id: dataset.id,
            name: dataset.name,
            tag: dataset.tag,
            kind: dataset.kind,
            content: dataset.content,
            created_at: dataset.created_at,
        }
    }
}

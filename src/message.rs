use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn is_false(value: &bool) -> bool {
    !value
}

/// One enclosing scope in an ancestor path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentFrame {
    pub id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
}

/// Nearest enclosing scope of an execution. `path` holds the scopes above it, nearest first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parent {
    pub id: String,
    #[serde(default)]
    pub execution_id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<ParentFrame>,
}

impl Parent {
    pub fn new(id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            execution_id: execution_id.into(),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: Vec<ParentFrame>) -> Self {
        self.path = path;
        self
    }

    fn frame(&self) -> ParentFrame {
        ParentFrame {
            id: self.id.clone(),
            execution_id: self.execution_id.clone(),
            element_type: self.element_type.clone(),
        }
    }
}

impl From<ParentFrame> for Parent {
    fn from(frame: ParentFrame) -> Self {
        Self {
            id: frame.id,
            execution_id: frame.execution_id,
            element_type: frame.element_type,
            path: Vec::new(),
        }
    }
}

/// Move one level up the scope tree. The nearest ancestor in `path` becomes the parent.
pub fn shift_parent(parent: Option<&Parent>) -> Option<Parent> {
    let parent = parent?;
    let (first, rest) = parent.path.split_first()?;
    Some(Parent::from(first.clone()).with_path(rest.to_vec()))
}

/// Move one level down the scope tree, adopting `adopting` as the nearest parent.
pub fn unshift_parent(parent: Option<&Parent>, adopting: &Content) -> Parent {
    let id = adopting.id.clone().unwrap_or_default();
    let execution_id = adopting.execution_id.clone().unwrap_or_default();
    let Some(parent) = parent else {
        return Parent {
            id,
            execution_id,
            element_type: adopting.element_type.clone(),
            path: Vec::new(),
        };
    };

    let mut clone = parent.clone();
    if clone.id == id {
        if !execution_id.is_empty() {
            clone.execution_id = execution_id;
        }
        return clone;
    }

    clone.path.insert(0, parent.frame());
    clone.id = id;
    clone.execution_id = execution_id;
    clone.element_type = adopting.element_type.clone();
    clone
}

/// Append `ancestor` to the far end of the path unless it is already part of it.
pub fn push_parent(parent: Option<&Parent>, ancestor: &Parent) -> Parent {
    let Some(parent) = parent else {
        return ancestor.frame().into();
    };

    if parent.id == ancestor.id {
        let mut clone = parent.clone();
        clone.execution_id = ancestor.execution_id.clone();
        return clone;
    }

    let mut clone = parent.clone();
    if let Some(frame) = clone.path.iter_mut().find(|frame| frame.id == ancestor.id) {
        frame.execution_id = ancestor.execution_id.clone();
    } else {
        clone.path.push(ancestor.frame());
    }
    clone
}

/// Message content. Known keys are typed, everything else lives in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub element_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Parent>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_multi_instance: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_root_scope: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Content {
    pub fn new(id: impl Into<String>, execution_id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            execution_id: Some(execution_id.into()),
            ..Default::default()
        }
    }

    pub fn execution_id(&self) -> Result<&str> {
        self.execution_id.as_deref().ok_or(Error::MissingExecutionId)
    }

    pub fn parent(&self) -> Result<&Parent> {
        self.parent.as_ref().ok_or_else(|| {
            Error::MissingParent(self.execution_id.clone().unwrap_or_default())
        })
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_parent(mut self, parent: Option<Parent>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<Value>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<Value>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.extra.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fields {
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub redelivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Properties {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub persistent: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub delegate: bool,
}

impl Properties {
    pub fn typed(message_type: impl Into<String>) -> Self {
        Self {
            message_type: Some(message_type.into()),
            ..Default::default()
        }
    }

    pub fn delegated(mut self) -> Self {
        self.delegate = true;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub fields: Fields,
    pub content: Content,
    pub properties: Properties,
}

impl Message {
    /// Message as it would arrive from `exchange` with `routing_key`.
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, content: Content) -> Self {
        Self {
            fields: Fields {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                ..Default::default()
            },
            content,
            properties: Default::default(),
        }
    }

    pub fn redelivered(mut self) -> Self {
        self.fields.redelivered = true;
        self
    }

    pub fn routing_key(&self) -> &str {
        &self.fields.routing_key
    }

    /// Evaluation scope exposed to expressions: `{fields, content, properties}`.
    pub fn to_scope(&self) -> Result<Value> {
        let mut scope = Map::new();
        scope.insert("fields".into(), serde_json::to_value(&self.fields)?);
        scope.insert("content".into(), self.content.to_value()?);
        scope.insert("properties".into(), serde_json::to_value(&self.properties)?);
        Ok(Value::Object(scope))
    }
}

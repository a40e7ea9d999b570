//! 函数描述与加载选项。

use std::collections::BTreeMap;
use std::time::Duration;

use crate::message::{BindingInfo, FunctionLoadRequest, FunctionMetadataResult, RpcFunctionMetadata};

/// 宿主侧已知的函数描述，用于建立输入缓冲与发送加载请求。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FunctionDescriptor {
    pub function_id: String,
    pub name: String,
    pub directory: String,
    pub script_file: String,
    pub entry_point: String,
    pub is_proxy: bool,
    /// 禁用的函数仍会被加载（可经管理端点触发），但排在最后。
    pub is_disabled: bool,
    pub bindings: BTreeMap<String, BindingInfo>,
    pub properties: BTreeMap<String, String>,
}

impl FunctionDescriptor {
    pub fn new(function_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn disabled(mut self) -> Self {
        self.is_disabled = true;
        self
    }

    pub fn with_binding(mut self, name: impl Into<String>, binding: BindingInfo) -> Self {
        self.bindings.insert(name.into(), binding);
        self
    }

    pub(crate) fn to_load_request(&self, managed_dependency_enabled: bool) -> FunctionLoadRequest {
        FunctionLoadRequest {
            function_id: self.function_id.clone(),
            metadata: RpcFunctionMetadata {
                name: self.name.clone(),
                directory: self.directory.clone(),
                script_file: self.script_file.clone(),
                entry_point: self.entry_point.clone(),
                is_proxy: self.is_proxy,
                bindings: self.bindings.clone(),
                properties: self.properties.clone(),
            },
            managed_dependency_enabled,
        }
    }
}

/// Worker 索引得到的原始函数元数据。
///
/// Worker 要求宿主使用默认索引时，只返回一个 `metadata` 为空的占位项。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawFunctionMetadata {
    pub metadata: Option<FunctionMetadataResult>,
    pub use_default_metadata_indexing: bool,
}

/// `send_function_load_requests` 的选项。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FunctionLoadOptions {
    pub managed_dependency_enabled: bool,
    /// 函数执行超时；给出时加载超时取其与配置下限中的较大者，否则加载不设超时。
    pub function_timeout: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::BindingDirection;

    #[test]
    fn load_request_carries_metadata() {
        let descriptor = FunctionDescriptor::new("f-1", "HttpTrigger").with_binding(
            "req",
            BindingInfo {
                binding_type: "httpTrigger".into(),
                direction: BindingDirection::In,
            },
        );
        let request = descriptor.to_load_request(true);
        assert_eq!(request.function_id, "f-1");
        assert_eq!(request.metadata.name, "HttpTrigger");
        assert!(request.managed_dependency_enabled);
        assert!(request.metadata.bindings.contains_key("req"));
    }
}

//! Fixed tool catalog. Each tool is one REST call against the StreamOps API.

use lib_streamops::retrieve::Method;
use serde_json::{json, Map, Value};

use super::protocol::Tool;

/// Where a tool argument goes in the HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgPlace {
    /// Replaces `{name}` in the path template. Always required.
    Path,
    Query,
    /// The whole JSON body. Required.
    Body,
}

#[derive(Debug, Clone, Copy)]
pub struct ArgSpec {
    pub name: &'static str,
    pub place: ArgPlace,
    pub description: &'static str,
}

const fn path(name: &'static str, description: &'static str) -> ArgSpec {
    ArgSpec {
        name,
        place: ArgPlace::Path,
        description,
    }
}

const fn query(name: &'static str, description: &'static str) -> ArgSpec {
    ArgSpec {
        name,
        place: ArgPlace::Query,
        description,
    }
}

const fn body(name: &'static str, description: &'static str) -> ArgSpec {
    ArgSpec {
        name,
        place: ArgPlace::Body,
        description,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub method: HttpVerb,
    /// Slash-separated, relative to the API base, e.g. `jobs/{id}/cancel`.
    pub path: &'static str,
    pub args: &'static [ArgSpec],
}

/// `Method` is not const-constructible, so the catalog stores this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVerb {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpVerb {
    pub fn method(self) -> Method {
        match self {
            HttpVerb::Get => Method::GET,
            HttpVerb::Post => Method::POST,
            HttpVerb::Patch => Method::PATCH,
            HttpVerb::Delete => Method::DELETE,
        }
    }
}

/// A tool call ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCall {
    pub method: Method,
    pub segments: Vec<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ResolvedCall {
    pub fn segments(&self) -> Vec<&str> {
        self.segments.iter().map(String::as_str).collect()
    }

    pub fn query(&self) -> Vec<(&str, &str)> {
        self.query.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect()
    }
}

const PAGING: [ArgSpec; 2] = [
    query("limit", "Maximum number of items to return."),
    query("offset", "Number of items to skip."),
];

pub const CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "list_jobs",
        description: "List processing jobs, newest first.",
        method: HttpVerb::Get,
        path: "jobs",
        args: &[query("status", "Filter by job status."), PAGING[0], PAGING[1]],
    },
    ToolSpec {
        name: "get_job",
        description: "Get one job by id.",
        method: HttpVerb::Get,
        path: "jobs/{id}",
        args: &[path("id", "Job id.")],
    },
    ToolSpec {
        name: "cancel_job",
        description: "Cancel a queued or running job.",
        method: HttpVerb::Post,
        path: "jobs/{id}/cancel",
        args: &[path("id", "Job id.")],
    },
    ToolSpec {
        name: "retry_job",
        description: "Retry a failed job.",
        method: HttpVerb::Post,
        path: "jobs/{id}/retry",
        args: &[path("id", "Job id.")],
    },
    ToolSpec {
        name: "list_assets",
        description: "List media assets.",
        method: HttpVerb::Get,
        path: "assets",
        args: &[
            query("search", "Free-text search on names and paths."),
            query("status", "Filter by asset status."),
            PAGING[0],
            PAGING[1],
        ],
    },
    ToolSpec {
        name: "get_asset",
        description: "Get one asset by id.",
        method: HttpVerb::Get,
        path: "assets/{id}",
        args: &[path("id", "Asset id.")],
    },
    ToolSpec {
        name: "update_asset",
        description: "Patch asset fields such as tags or name.",
        method: HttpVerb::Patch,
        path: "assets/{id}",
        args: &[path("id", "Asset id."), body("changes", "Fields to update.")],
    },
    ToolSpec {
        name: "delete_asset",
        description: "Delete an asset record.",
        method: HttpVerb::Delete,
        path: "assets/{id}",
        args: &[path("id", "Asset id.")],
    },
    ToolSpec {
        name: "list_drives",
        description: "List monitored drives with their online state.",
        method: HttpVerb::Get,
        path: "drives",
        args: &[],
    },
    ToolSpec {
        name: "list_rules",
        description: "List automation rules.",
        method: HttpVerb::Get,
        path: "rules",
        args: &[],
    },
    ToolSpec {
        name: "update_rule",
        description: "Patch an automation rule, e.g. to enable or disable it.",
        method: HttpVerb::Patch,
        path: "rules/{id}",
        args: &[path("id", "Rule id."), body("changes", "Fields to update.")],
    },
    ToolSpec {
        name: "list_obs_connections",
        description: "List configured OBS connections.",
        method: HttpVerb::Get,
        path: "obs/connections",
        args: &[],
    },
    ToolSpec {
        name: "system_summary",
        description: "Counts of jobs, assets and drives by state.",
        method: HttpVerb::Get,
        path: "system/summary",
        args: &[],
    },
    ToolSpec {
        name: "system_stats",
        description: "Current CPU, memory, disk and GPU usage.",
        method: HttpVerb::Get,
        path: "system/stats",
        args: &[],
    },
    ToolSpec {
        name: "list_logs",
        description: "Recent backend log entries.",
        method: HttpVerb::Get,
        path: "logs",
        args: &[query("level", "Minimum level."), PAGING[0]],
    },
    ToolSpec {
        name: "get_settings",
        description: "Read backend settings.",
        method: HttpVerb::Get,
        path: "settings",
        args: &[],
    },
];

pub fn find(name: &str) -> Option<&'static ToolSpec> {
    CATALOG.iter().find(|tool| tool.name == name)
}

impl ToolSpec {
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for arg in self.args {
            let schema = match arg.place {
                ArgPlace::Body => json!({"type": "object", "description": arg.description}),
                _ => json!({"type": "string", "description": arg.description}),
            };
            properties.insert(arg.name.to_string(), schema);
            if arg.place != ArgPlace::Query {
                required.push(arg.name);
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn to_tool(&self) -> Tool {
        Tool {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.input_schema(),
        }
    }

    /// Builds the HTTP call from `arguments`. Errors name the offending
    /// argument.
    pub fn resolve(&self, arguments: Option<&Value>) -> Result<ResolvedCall, String> {
        let empty = Map::new();
        let args = match arguments {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(map)) => map,
            Some(_) => return Err("arguments must be an object".to_string()),
        };

        let mut segments: Vec<String> = Vec::new();
        for part in self.path.split('/') {
            match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                Some(name) => segments.push(scalar(args, name)?.ok_or_else(|| missing(name))?),
                None => segments.push(part.to_string()),
            }
        }

        let mut query = Vec::new();
        let mut body = None;
        for arg in self.args {
            match arg.place {
                ArgPlace::Path => {}
                ArgPlace::Query => {
                    if let Some(value) = scalar(args, arg.name)? {
                        query.push((arg.name.to_string(), value));
                    }
                }
                ArgPlace::Body => match args.get(arg.name) {
                    Some(value @ Value::Object(_)) => body = Some(value.clone()),
                    Some(_) => return Err(format!("argument '{}' must be an object", arg.name)),
                    None => return Err(missing(arg.name)),
                },
            }
        }

        Ok(ResolvedCall {
            method: self.method.method(),
            segments,
            query,
            body,
        })
    }
}

fn missing(name: &str) -> String {
    format!("missing required argument '{}'", name)
}

/// Strings pass through, numbers and booleans are stringified.
fn scalar(args: &Map<String, Value>, name: &str) -> Result<Option<String>, String> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(Some(v.to_string())),
        Some(_) => Err(format!("argument '{}' must be a string", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_names_are_unique() {
        let names: HashSet<_> = CATALOG.iter().map(|t| t.name).collect();
        assert_eq!(names.len(), CATALOG.len());
    }

    #[test]
    fn test_resolve_path_and_query() {
        let call = find("list_jobs")
            .unwrap()
            .resolve(Some(&json!({"status": "failed", "limit": 20})))
            .unwrap();
        assert_eq!(call.method, Method::GET);
        assert_eq!(call.segments(), vec!["jobs"]);
        assert_eq!(call.query(), vec![("status", "failed"), ("limit", "20")]);

        let call = find("cancel_job").unwrap().resolve(Some(&json!({"id": 42}))).unwrap();
        assert_eq!(call.method, Method::POST);
        assert_eq!(call.segments(), vec!["jobs", "42", "cancel"]);
        assert!(call.body.is_none());
    }

    #[test]
    fn test_resolve_body() {
        let call = find("update_asset")
            .unwrap()
            .resolve(Some(&json!({"id": "a1", "changes": {"tags": ["promo"]}})))
            .unwrap();
        assert_eq!(call.method, Method::PATCH);
        assert_eq!(call.body, Some(json!({"tags": ["promo"]})));
    }

    #[test]
    fn test_resolve_rejects_bad_arguments() {
        let tool = find("get_job").unwrap();
        assert_eq!(tool.resolve(None).unwrap_err(), "missing required argument 'id'");
        assert!(tool.resolve(Some(&json!(["j1"]))).is_err());
        assert!(tool.resolve(Some(&json!({"id": {"nested": 1}}))).is_err());
        assert!(find("update_rule").unwrap().resolve(Some(&json!({"id": "r1"}))).is_err());
    }

    #[test]
    fn test_schema_lists_required_arguments() {
        let schema = find("update_rule").unwrap().input_schema();
        assert_eq!(schema["required"], json!(["id", "changes"]));
        assert_eq!(schema["properties"]["changes"]["type"], "object");
        assert_eq!(find("list_drives").unwrap().input_schema()["required"], json!([]));
    }
}

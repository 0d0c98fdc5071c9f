//! Compiles the nested-mapping GraphQL DSL used by endpoint definitions into
//! a query document.
//!
//! ```yaml
//! query:
//!   Viewer:
//!     "@vars": [{ $id: ID }]
//!     user:
//!       "@args": { id: $id }
//!       name: null
//! ```
//!
//! renders as `query Viewer($id: ID) { user(id: $id) { name } }`.

use apollo_compiler::ast;
use apollo_compiler::{Name, Node};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::GraphQLError;
use crate::value::to_text;

const VARS_KEY: &str = "@vars";
const ARGS_KEY: &str = "@args";
const ALIAS_KEY: &str = "@alias";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphQLQuery {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub query: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
}

impl GraphQLQuery {
    pub fn render(&self) -> Result<String, GraphQLError> {
        let document = document(&self.query)?;
        Ok(document.serialize().indent_prefix("  ").to_string())
    }
}

fn error(path: &str, message: impl Into<String>) -> GraphQLError {
    GraphQLError {
        path: path.to_string(),
        message: message.into(),
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn name(text: &str, path: &str) -> Result<Name, GraphQLError> {
    Name::new(text).map_err(|_| error(path, format!("{text:?} is not a valid GraphQL name")))
}

/// Argument values keep their JSON shape; strings starting with `$`
/// reference operation variables.
fn argument_value(value: &Value, path: &str) -> Result<ast::Value, GraphQLError> {
    Ok(match value {
        Value::Null => ast::Value::Null,
        Value::Bool(flag) => ast::Value::Boolean(*flag),
        Value::Number(num) if num.is_i64() || num.is_u64() => {
            ast::Value::Int(ast::IntValue::new_parsed(&num.to_string()))
        }
        Value::Number(num) => ast::Value::Float(ast::FloatValue::new_parsed(&num.to_string())),
        Value::String(text) => match text.strip_prefix('$') {
            Some(variable) => ast::Value::Variable(name(variable, path)?),
            None => ast::Value::String(text.clone()),
        },
        Value::Array(items) => ast::Value::List(
            items
                .iter()
                .map(|item| argument_value(item, path).map(Node::new))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => ast::Value::Object(
            map.iter()
                .map(|(key, item)| Ok((name(key.trim(), path)?, Node::new(argument_value(item, path)?))))
                .collect::<Result<_, GraphQLError>>()?,
        ),
    })
}

/// `@vars` and `@args` accept a mapping or a list of single-entry mappings.
fn definition_entries<'a>(value: Option<&'a Value>, path: &str) -> Result<Vec<(&'a String, &'a Value)>, GraphQLError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Object(map)) => Ok(map.iter().collect()),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(Value::as_object)
            .flat_map(|map| map.iter())
            .collect()),
        Some(_) => Err(error(
            path,
            "definitions must be a list of objects or `name: type` strings",
        )),
    }
}

fn variable_definitions(value: Option<&Value>, path: &str) -> Result<Vec<Node<ast::VariableDefinition>>, GraphQLError> {
    let mut out = Vec::new();
    for (variable, type_name) in definition_entries(value, path)? {
        let variable = variable.trim().trim_start_matches('$');
        if variable.is_empty() {
            return Err(error(path, "variable definition without a name"));
        }
        let type_name = to_text(type_name);
        let type_name = type_name.trim();
        if type_name.is_empty() {
            return Err(error(path, format!("variable ${variable} has no type")));
        }
        let ty = ast::Type::parse(type_name, "variables.graphql")
            .map_err(|_| error(path, format!("variable ${variable} has an invalid type {type_name:?}")))?;
        out.push(Node::new(ast::VariableDefinition {
            name: name(variable, path)?,
            ty: Node::new(ty),
            default_value: None,
            directives: ast::DirectiveList(vec![]),
        }));
    }
    Ok(out)
}

fn arguments(value: Option<&Value>, path: &str) -> Result<Vec<Node<ast::Argument>>, GraphQLError> {
    definition_entries(value, path)?
        .into_iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, item)| {
            Ok(Node::new(ast::Argument {
                name: name(key.trim(), path)?,
                value: Node::new(argument_value(item, path)?),
            }))
        })
        .collect()
}

fn field(alias: Option<&str>, field_name: &str, path: &str) -> Result<ast::Field, GraphQLError> {
    Ok(ast::Field {
        alias: alias
            .filter(|alias| !alias.is_empty() && *alias != field_name)
            .map(|alias| name(alias, path))
            .transpose()?,
        name: name(field_name, path)?,
        arguments: Vec::new(),
        directives: ast::DirectiveList(vec![]),
        selection_set: Vec::new(),
    })
}

fn selections(definition: &Map<String, Value>, path: &str) -> Result<Vec<ast::Selection>, GraphQLError> {
    let mut fields = Vec::new();
    for (key, body) in definition {
        if key.starts_with('@') || key.trim().is_empty() {
            continue;
        }
        let key = key.trim();
        let here = child_path(path, key);
        let selection = match body {
            Value::Object(sub) => {
                let alias = sub.get(ALIAS_KEY).and_then(Value::as_str);
                ast::Field {
                    arguments: arguments(sub.get(ARGS_KEY), &here)?,
                    selection_set: selections(sub, &here)?,
                    ..field(alias, key, &here)?
                }
            }
            Value::String(renamed) if !renamed.trim().is_empty() => field(Some(key), renamed.trim(), &here)?,
            _ => field(None, key, &here)?,
        };
        fields.push(ast::Selection::Field(Node::new(selection)));
    }
    Ok(fields)
}

fn document(query: &Map<String, Value>) -> Result<ast::Document, GraphQLError> {
    let mut document = ast::Document::new();
    for (operation, body) in query {
        let operation = operation.trim();
        let empty = Map::new();
        let body = match body {
            Value::Object(map) => map,
            Value::Null => &empty,
            _ => return Err(error(operation, "operation body must be a mapping")),
        };
        let selection_set = selections(body, operation)?;
        if selection_set.is_empty() {
            return Err(error(operation, "operation selects no fields"));
        }
        let definition = ast::OperationDefinition {
            operation_type: ast::OperationType::Query,
            name: match operation {
                "" => None,
                named => Some(name(named, operation)?),
            },
            variables: variable_definitions(body.get(VARS_KEY), operation)?,
            directives: ast::DirectiveList(vec![]),
            selection_set,
        };
        document
            .definitions
            .push(ast::Definition::OperationDefinition(Node::new(definition)));
    }
    Ok(document)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strip(text: &str) -> String {
        text.chars().filter(|c| !c.is_whitespace()).collect()
    }

    fn query(definition: Value) -> GraphQLQuery {
        serde_json::from_value(json!({ "query": definition })).unwrap()
    }

    fn rendered(definition: Value) -> String {
        let text = query(definition).render().unwrap();
        assert!(
            ast::Document::parse(text.as_str(), "query.graphql").is_ok(),
            "not a valid document: {text}"
        );
        text
    }

    #[test]
    fn renders_the_viewer_query() {
        let text = rendered(json!({
            "Viewer": {
                "@vars": [{ "$id": "ID" }],
                "user": { "@args": { "id": "$id" }, "name": null }
            }
        }));
        assert!(text.starts_with("query Viewer($id: ID) {\n  user(id: $id) {\n"), "{text}");
        assert_eq!(strip(&text), strip("query Viewer($id: ID) { user(id: $id) { name } }"));
    }

    #[test]
    fn renders_aliases_nested_arguments_and_variables() {
        let text = rendered(json!({
            "RumSparklineBydatetimeMinute": {
                "@vars": [
                    { "$accountTag": "string" },
                    { "$visitsFilter": "ZoneHttpRequestsAdaptiveGroupsFilter_InputObject" }
                ],
                "viewer": {
                    "accounts": {
                        "@args": { "filter": { "accountTag": "$accountTag" } },
                        "rumPageloadEventsAdaptiveGroups": {
                            "@alias": "visits",
                            "@args": { "limit": 5000 },
                            "sum": { "visits": null },
                            "avg": { "sampleInterval": null },
                            "dimensions": { "ts": "datetimeMinute" }
                        }
                    }
                }
            }
        }));

        let reference = r#"query RumSparklineBydatetimeMinute(
            $accountTag: string,
            $visitsFilter: ZoneHttpRequestsAdaptiveGroupsFilter_InputObject
        ) {
            viewer {
                accounts(filter: {accountTag: $accountTag}) {
                    visits: rumPageloadEventsAdaptiveGroups(limit: 5000) {
                        sum { visits }
                        avg { sampleInterval }
                        dimensions { ts: datetimeMinute }
                    }
                }
            }
        }"#;

        assert_eq!(strip(&text), strip(reference));
    }

    #[test]
    fn classifies_argument_values() {
        let text = rendered(json!({
            "Q": {
                "@vars": { "$tag": "[String!]!" },
                "items": {
                    "@args": [
                        { "first": 10 },
                        { "ratio": 0.5 },
                        { "active": true },
                        { "label": "hi" },
                        { "tags": ["a", "$tag"] },
                        { "after": null }
                    ],
                    "id": null
                }
            }
        }));
        assert!(
            strip(&text).contains(r#"items(first:10,ratio:0.5,active:true,label:"hi",tags:["a",$tag],after:null)"#),
            "{text}"
        );
        assert!(strip(&text).starts_with("queryQ($tag:[String!]!)"), "{text}");
    }

    #[test]
    fn quotes_in_string_arguments_stay_valid() {
        let text = rendered(json!({ "Q": { "search": { "@args": { "term": "say \"hi\"" }, "id": null } } }));
        let document = ast::Document::parse(text.as_str(), "query.graphql").unwrap();
        let ast::Definition::OperationDefinition(operation) = &document.definitions[0] else {
            panic!("{text}");
        };
        let ast::Selection::Field(search) = &operation.selection_set[0] else {
            panic!("{text}");
        };
        assert_eq!(*search.arguments[0].value, ast::Value::String("say \"hi\"".to_string()));
    }

    #[test]
    fn malformed_arguments_name_the_field() {
        let gql = query(json!({ "Q": { "user": { "@args": "id", "name": null } } }));
        let err = gql.render().unwrap_err();
        assert_eq!(err.path, "Q.user");
    }

    #[test]
    fn invalid_names_are_rejected() {
        let err = query(json!({ "Q": { "user-name": null } })).render().unwrap_err();
        assert_eq!(err.path, "Q.user-name");

        let err = query(json!({ "Q": { "@vars": { "$id": "[ID" }, "id": null } }))
            .render()
            .unwrap_err();
        assert_eq!(err.path, "Q");
    }

    #[test]
    fn operations_without_fields_are_rejected() {
        let err = query(json!({ "Q": {}, "R": { "a": null } })).render().unwrap_err();
        assert_eq!(err.path, "Q");

        let err = query(json!({ "R": { "@vars": { "$x": "Int" } } })).render().unwrap_err();
        assert_eq!(err.path, "R");
        assert_eq!(err.to_string(), "graphql [R]: operation selects no fields");
    }

    #[test]
    fn several_operations_render_into_one_document() {
        let text = rendered(json!({ "A": { "a": null }, "B": { "b": null } }));
        assert_eq!(strip(&text), "queryA{a}queryB{b}");
    }

    #[test]
    fn alias_equal_to_name_is_not_printed() {
        let text = rendered(json!({ "Q": { "user": { "@alias": "user", "id": "id" } } }));
        assert_eq!(strip(&text), "queryQ{user{id}}");
    }
}

//! JSON variant of the configuration surface.
//!
//! `terragrunt.hcl.json` files carry the same abstract syntax as the HCL
//! surface. Top-level keys naming known block types become blocks (labelled
//! where the block type is labelled); every other key becomes an attribute.
//! Strings containing `${` interpolation are parsed as template expressions
//! so the JSON surface keeps access to functions and references.

use hcl::expr::{Expression, Object, ObjectKey, TemplateExpr};
use hcl::structure::{Attribute, Block, Body};
use serde_json::Value as Json;

/// Block types whose JSON value is a map from label to block body.
const LABELLED_BLOCKS: &[&str] = &["dependency", "generate", "feature"];

/// Block types with a single, unlabelled body.
const UNLABELLED_BLOCKS: &[&str] = &[
    "locals",
    "terraform",
    "remote_state",
    "dependencies",
    "errors",
    "exclude",
    "catalog",
];

/// Converts a parsed JSON document into an HCL body.
pub fn json_to_body(doc: &Json) -> Result<Body, String> {
    let obj = doc
        .as_object()
        .ok_or_else(|| "top-level JSON value must be an object".to_string())?;

    let mut builder = Body::builder();
    for (key, value) in obj {
        if key == "include" {
            builder = add_include(builder, value)?;
        } else if LABELLED_BLOCKS.contains(&key.as_str()) {
            let labels = value
                .as_object()
                .ok_or_else(|| format!("{key} must be an object of named blocks"))?;
            for (label, body) in labels {
                builder = builder.add_block(block_from_json(key, Some(label), body)?);
            }
        } else if UNLABELLED_BLOCKS.contains(&key.as_str()) {
            builder = builder.add_block(block_from_json(key, None, value)?);
        } else {
            builder = builder.add_attribute(Attribute::new(key.as_str(), json_to_expression(value)));
        }
    }
    Ok(builder.build())
}

/// `include` accepts either one bare object or a map of named includes.
fn add_include(
    builder: hcl::structure::BodyBuilder,
    value: &Json,
) -> Result<hcl::structure::BodyBuilder, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "include must be an object".to_string())?;
    if obj.contains_key("path") {
        return Ok(builder.add_block(block_from_json("include", None, value)?));
    }
    let mut builder = builder;
    for (label, body) in obj {
        builder = builder.add_block(block_from_json("include", Some(label), body)?);
    }
    Ok(builder)
}

fn block_from_json(ident: &str, label: Option<&str>, value: &Json) -> Result<Block, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| format!("{ident} block must be an object"))?;

    let mut builder = Block::builder(ident);
    if let Some(label) = label {
        builder = builder.add_label(label);
    }
    for (key, inner) in obj {
        // Nested labelled block types inside `terraform` and `errors`.
        let nested = matches!(
            (ident, key.as_str()),
            ("terraform", "before_hook")
                | ("terraform", "after_hook")
                | ("terraform", "error_hook")
                | ("terraform", "extra_arguments")
                | ("errors", "retry")
                | ("errors", "ignore")
        );
        if nested {
            let labels = inner
                .as_object()
                .ok_or_else(|| format!("{ident}.{key} must be an object of named blocks"))?;
            for (label, body) in labels {
                builder = builder.add_block(block_from_json(key, Some(label), body)?);
            }
        } else {
            builder = builder.add_attribute(Attribute::new(key.as_str(), json_to_expression(inner)));
        }
    }
    Ok(builder.build())
}

fn json_to_expression(value: &Json) -> Expression {
    match value {
        Json::Null => Expression::Null,
        Json::Bool(b) => Expression::Bool(*b),
        Json::Number(n) => {
            let number = if let Some(i) = n.as_i64() {
                hcl::Number::from(i)
            } else {
                hcl::Number::from_f64(n.as_f64().unwrap_or(0.0))
                    .unwrap_or_else(|| hcl::Number::from(0))
            };
            Expression::Number(number)
        }
        Json::String(s) => {
            if s.contains("${") {
                Expression::TemplateExpr(Box::new(TemplateExpr::QuotedString(s.clone())))
            } else {
                Expression::String(s.clone())
            }
        }
        Json::Array(items) => Expression::Array(items.iter().map(json_to_expression).collect()),
        Json::Object(map) => {
            let mut obj = Object::new();
            for (k, v) in map {
                obj.insert(
                    ObjectKey::Expression(Expression::String(k.clone())),
                    json_to_expression(v),
                );
            }
            Expression::Object(obj)
        }
    }
}

//! End-to-end lookups and invocations through the public API.

use function_catalog::prelude::*;
use function_catalog::{Bytes, CompositionResolver};
use futures::stream::{BoxStream, StreamExt};
use serde_json::json;

fn text_catalog() -> FunctionCatalog {
    let catalog = FunctionCatalog::new();
    catalog
        .register("upper", Callable::from_fn(|s: String| s.to_uppercase()), None)
        .unwrap();
    catalog
        .register("lower", Callable::from_fn(|s: String| s.to_lowercase()), None)
        .unwrap();
    catalog
        .register(
            "reverse",
            Callable::from_fn(|s: String| s.chars().rev().collect::<String>()),
            None,
        )
        .unwrap();
    catalog
        .register(
            "shout",
            Callable::from_stream_fn(|s: BoxStream<'static, String>| {
                s.map(|v| v.to_uppercase()).boxed()
            }),
            None,
        )
        .unwrap();
    catalog
}

async fn invoke_single(wrapper: &FunctionInvocationWrapper, input: &str) -> Payload {
    wrapper
        .invoke(Some(Data::from(input)))
        .await
        .unwrap()
        .and_then(Data::into_single)
        .unwrap()
}

#[tokio::test]
async fn test_uppercase_json_string() {
    let catalog = text_catalog();
    let wrapper = catalog.lookup("upper", None).unwrap();
    assert_eq!(wrapper.kind(), FunctionKind::Function);
    assert_eq!(invoke_single(&wrapper, "\"oleg\"").await, Payload::from("\"OLEG\""));
}

#[tokio::test]
async fn test_lower_then_reverse() {
    let catalog = text_catalog();
    let wrapper = catalog.lookup("lower|reverse", Some("application/json")).unwrap();
    assert!(wrapper.is_composite());
    assert_eq!(invoke_single(&wrapper, "\"ABC\"").await, Payload::from("\"cba\""));
}

#[test]
fn test_missing_function_is_named() {
    let catalog = text_catalog();
    let err = catalog.lookup("missing", None).unwrap_err();
    assert!(matches!(&err, CatalogError::UnknownFunction(name) if name == "missing"));
    assert!(err.is_resolution_error());

    let err = catalog.lookup("upper|nope|lower", None).unwrap_err();
    assert!(matches!(err, CatalogError::UnknownFunction(name) if name == "nope"));
}

#[tokio::test]
async fn test_stream_elements_converted_independently() {
    let catalog = text_catalog();
    let wrapper = catalog
        .lookup("shout", Some("application/octet-stream"))
        .unwrap();
    assert_eq!(wrapper.input_shape(), Some(Shape::stream(ElementType::Text)));

    let out = wrapper
        .invoke(Some(Data::stream_of(["foo", "bar"])))
        .await
        .unwrap()
        .unwrap();
    let items = out.collect().await.unwrap();
    assert_eq!(
        items,
        vec![
            Payload::Bytes(Bytes::from_static(b"FOO")),
            Payload::Bytes(Bytes::from_static(b"BAR")),
        ]
    );
}

#[test]
fn test_scalar_into_stream_rejected_at_first_boundary() {
    let catalog = text_catalog();
    let err = catalog.lookup("upper|shout", None).unwrap_err();
    match err {
        CatalogError::IncompatibleComposition { boundary, .. } => assert_eq!(boundary, 1),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_composition_equals_sequential_calls() {
    let catalog = text_catalog();
    let pairs = [("lower", "reverse"), ("reverse", "upper"), ("upper", "upper")];
    let inputs = ["\"Hello\"", "\"\"", "\"ÀbC dEf\""];

    for (first, second) in pairs {
        let composed = catalog.lookup(&format!("{first}|{second}"), None).unwrap();
        let a = catalog.lookup(first, None).unwrap();
        let b = catalog.lookup(second, None).unwrap();
        for input in inputs {
            let direct = invoke_single(&composed, input).await;
            let intermediate = invoke_single(&a, input).await;
            let chained = invoke_single(&b, &intermediate.to_string()).await;
            assert_eq!(direct, chained, "{first}|{second} on {input}");
        }
    }
}

#[test]
fn test_whitespace_and_comma_separators() {
    let catalog = text_catalog();
    let spaced = catalog.lookup(" lower | reverse ", None).unwrap();
    assert_eq!(spaced.function_names(), vec!["lower", "reverse"]);
    let commas = catalog.lookup("lower,reverse", None).unwrap();
    assert_eq!(commas.function_names(), vec!["lower", "reverse"]);
    assert!(matches!(
        catalog.lookup("lower||reverse", None),
        Err(CatalogError::EmptyDefinition)
    ));
}

#[tokio::test]
async fn test_self_composition() {
    let catalog = text_catalog();
    let wrapper = catalog.lookup("reverse|reverse", None).unwrap();
    assert_eq!(invoke_single(&wrapper, "\"abc\"").await, Payload::from("\"abc\""));
}

#[tokio::test]
async fn test_records_and_text_mix_in_composition() {
    let catalog = text_catalog();
    catalog
        .register(
            "greet",
            Callable::from_fn(|v: serde_json::Value| {
                json!({ "greeting": format!("hello {}", v["name"].as_str().unwrap_or("?")) })
            }),
            None,
        )
        .unwrap();
    let wrapper = catalog.lookup("greet|upper", None).unwrap();
    let out = invoke_single(&wrapper, r#"{"name":"oleg"}"#).await;
    let expected = serde_json::to_string(r#"{"GREETING":"HELLO OLEG"}"#).unwrap();
    assert_eq!(out, Payload::from(expected));
}

#[tokio::test]
async fn test_supplier_and_consumer_compositions() {
    let catalog = text_catalog();
    let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    catalog
        .register("hello", Callable::from_supplier(|| "Hello".to_string()), None)
        .unwrap();
    catalog
        .register(
            "collect",
            Callable::from_consumer(move |s: String| sink.lock().unwrap().push(s)),
            None,
        )
        .unwrap();

    let supplier = catalog.lookup("hello|upper", None).unwrap();
    assert_eq!(supplier.kind(), FunctionKind::Supplier);
    let out = supplier.invoke(None).await.unwrap().and_then(Data::into_single);
    assert_eq!(out, Some(Payload::from("\"HELLO\"")));

    let consumer = catalog.lookup("reverse|collect", None).unwrap();
    assert_eq!(consumer.kind(), FunctionKind::Consumer);
    assert!(consumer.invoke(Some(Data::from("\"abc\""))).await.unwrap().is_none());

    let runnable = catalog.lookup("hello|collect", None).unwrap();
    assert!(runnable.invoke(None).await.unwrap().is_none());
    assert_eq!(*seen.lock().unwrap(), vec!["cba".to_string(), "Hello".to_string()]);

    assert!(matches!(
        catalog.lookup("collect|upper", None),
        Err(CatalogError::IncompatibleComposition { boundary: 1, .. })
    ));
}

#[tokio::test]
async fn test_execution_error_carries_segment() {
    let catalog = text_catalog();
    catalog
        .register(
            "number",
            Callable::try_from_fn(|s: String| s.parse::<i64>().map(|n| (n + 1).to_string())),
            None,
        )
        .unwrap();
    let wrapper = catalog.lookup("reverse|number", None).unwrap();
    let err = wrapper.invoke(Some(Data::from("\"x1\""))).await.unwrap_err();
    match &err {
        CatalogError::FunctionExecution {
            function, segment, ..
        } => {
            assert_eq!(function, "number");
            assert_eq!(*segment, Some(2));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(std::error::Error::source(&err).is_some());
    // The wrapper is still usable
    assert_eq!(invoke_single(&wrapper, "\"14\"").await, Payload::from("\"42\""));
}

#[test]
fn test_resolver_matches_catalog_lookup() {
    let catalog = text_catalog();
    let names: Vec<String> = ["lower", "reverse"].iter().map(|s| s.to_string()).collect();
    let registry: std::collections::HashMap<_, _> = names
        .iter()
        .map(|n| (n.clone(), catalog.get(n).unwrap()))
        .collect();
    let resolved = CompositionResolver::resolve("lower|reverse", &names, &registry).unwrap();
    assert_eq!(resolved.kind(), FunctionKind::Function);
    assert_eq!(resolved.segments().len(), 2);
}

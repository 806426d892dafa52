use crate::*;

fn malformed_reason(s: &str) -> &'static str {
    match Signature::parse(s) {
        Err(ParseError::Malformed { reason, .. }) => reason,
        other => panic!("Expected malformed error for '{}', got {:?}", s, other),
    }
}

#[test]
fn test_basic_types() {
    let sig = Signature::parse("ybnqiuxtdsogh").unwrap();
    let codes: String = sig
        .types()
        .iter()
        .map(|t| t.as_basic().unwrap().code())
        .collect();
    assert_eq!(codes, "ybnqiuxtdsogh");
    assert_eq!(sig.len(), 13);
    assert_eq!(sig.as_str(), "ybnqiuxtdsogh");
}

#[test]
fn test_empty_signature() {
    let sig = Signature::parse("").unwrap();
    assert!(sig.is_empty());
    assert_eq!(sig, Signature::empty());
    assert!(Type::parse_single("").is_err());
}

#[test]
fn test_dict_of_variants() {
    let sig = Signature::parse("a{sv}").unwrap();
    assert_eq!(
        sig.single(),
        Some(&Type::Array(Box::new(Type::DictEntry(
            BasicType::String,
            Box::new(Type::Variant)
        ))))
    );
}

#[test]
fn test_nested() {
    let t = Type::parse_single("a(ia{s(vv)}ay)").unwrap();
    let expected = Type::Array(Box::new(Type::Struct(vec![
        Type::Basic(BasicType::Int32),
        Type::Array(Box::new(Type::DictEntry(
            BasicType::String,
            Box::new(Type::Struct(vec![Type::Variant, Type::Variant])),
        ))),
        Type::Array(Box::new(Type::Basic(BasicType::Byte))),
    ])));
    assert_eq!(t, expected);
    assert_eq!(t.to_string(), "a(ia{s(vv)}ay)");
}

#[test]
fn test_unmatched_brackets() {
    assert_eq!(malformed_reason("(i"), "unmatched '('");
    assert_eq!(malformed_reason("i)"), "unmatched ')'");
    assert_eq!(malformed_reason("a{sv"), "unmatched '{'");
    assert_eq!(malformed_reason("sv}"), "unmatched '}'");
    assert_eq!(malformed_reason("(a(ii)"), "unmatched '('");
}

#[test]
fn test_dict_entry_rules() {
    assert_eq!(malformed_reason("{sv}"), "dict entry outside of an array");
    assert_eq!(malformed_reason("a({sv})"), "dict entry outside of an array");
    assert_eq!(malformed_reason("a{vs}"), "dict entry key must be a basic type");
    assert_eq!(malformed_reason("a{(i)s}"), "dict entry key must be a basic type");
    assert_eq!(malformed_reason("a{s}"), "dict entry requires a value type");
    assert_eq!(malformed_reason("a{sss}"), "dict entry must hold exactly two types");
    assert_eq!(malformed_reason("a{}"), "empty dict entry");
}

#[test]
fn test_incomplete_types() {
    assert_eq!(malformed_reason("()"), "empty struct");
    assert_eq!(malformed_reason("a"), "expected a complete type");
    assert_eq!(malformed_reason("aa"), "expected a complete type");
    assert_eq!(malformed_reason("z"), "unknown type code");
    assert_eq!(malformed_reason("sä"), "unknown type code");
}

#[test]
fn test_error_offset() {
    match Signature::parse("ss(i") {
        Err(ParseError::Malformed { offset, .. }) => assert_eq!(offset, 2),
        other => panic!("Expected malformed error, got {:?}", other),
    }
}

#[test]
fn test_limits() {
    let long = "y".repeat(256);
    assert!(matches!(
        Signature::parse(&long),
        Err(ParseError::LimitExceeded { .. })
    ));
    assert!(Signature::parse(&"y".repeat(255)).is_ok());

    let deep_ok = format!("{}y", "a".repeat(32));
    assert!(Signature::parse(&deep_ok).is_ok());
    let deep = format!("{}y", "a".repeat(33));
    assert!(matches!(
        Signature::parse(&deep),
        Err(ParseError::LimitExceeded { .. })
    ));

    let structs = format!("{}y{}", "(".repeat(33), ")".repeat(33));
    assert!(matches!(
        Signature::parse(&structs),
        Err(ParseError::LimitExceeded { .. })
    ));
}

#[test]
fn test_single() {
    assert_eq!(
        Type::parse_single("v").unwrap(),
        Type::Variant
    );
    assert!(Type::parse_single("ss").is_err());
    assert!(Signature::parse("ss").unwrap().single().is_none());
}

#[test]
fn test_from_types() {
    let sig = Signature::from_types(vec![
        Type::Basic(BasicType::String),
        Type::Array(Box::new(Type::DictEntry(
            BasicType::UInt32,
            Box::new(Type::Variant),
        ))),
    ])
    .unwrap();
    assert_eq!(sig, "sa{uv}");

    assert!(Signature::from_types(vec![Type::Struct(vec![])]).is_err());
    assert!(Signature::from_types(vec![Type::DictEntry(
        BasicType::String,
        Box::new(Type::Variant)
    )])
    .is_err());
}

#[test]
fn test_try_from_type_checks_limits() {
    let sig = Signature::try_from(Type::Array(Box::new(Type::Basic(BasicType::Byte)))).unwrap();
    assert_eq!(sig, "ay");

    assert!(matches!(
        Signature::try_from(Type::Struct(vec![])),
        Err(ParseError::Malformed { reason: "empty struct", .. })
    ));

    let wide = Type::Struct(vec![Type::Basic(BasicType::Byte); 300]);
    assert!(matches!(
        Signature::try_from(wide),
        Err(ParseError::LimitExceeded { .. })
    ));

    let mut deep = Type::Basic(BasicType::Int32);
    for _ in 0..33 {
        deep = Type::Array(Box::new(deep));
    }
    assert!(matches!(
        Signature::try_from(deep),
        Err(ParseError::LimitExceeded { .. })
    ));
}

#[test]
fn test_alignment() {
    assert_eq!(Type::parse_single("y").unwrap().alignment(), 1);
    assert_eq!(Type::parse_single("b").unwrap().alignment(), 4);
    assert_eq!(Type::parse_single("n").unwrap().alignment(), 2);
    assert_eq!(Type::parse_single("t").unwrap().alignment(), 8);
    assert_eq!(Type::parse_single("s").unwrap().alignment(), 4);
    assert_eq!(Type::parse_single("g").unwrap().alignment(), 1);
    assert_eq!(Type::parse_single("ad").unwrap().alignment(), 4);
    assert_eq!(Type::parse_single("(y)").unwrap().alignment(), 8);
    assert_eq!(Type::parse_single("v").unwrap().alignment(), 1);
    assert_eq!(BasicType::Boolean.fixed_size(), Some(4));
    assert_eq!(BasicType::Byte.fixed_size(), Some(1));
    assert_eq!(BasicType::ObjectPath.fixed_size(), None);
}

#[test]
fn test_from_str() {
    let sig: Signature = "a(ss)".parse().unwrap();
    assert_eq!(format!("{}", sig), "a(ss)");
    assert!("a(ss".parse::<Signature>().is_err());
}

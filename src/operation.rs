use graphql_parser::query::{Definition, OperationDefinition, parse_query};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// Kind of the operation `operation_name` selects in `query`.
///
/// Without a name the document must contain exactly one operation.
pub fn operation_kind(query: &str, operation_name: Option<&str>) -> Result<OperationKind, String> {
    let document =
        parse_query::<String>(query).map_err(|e| format!("Failed to parse query: {}", e))?;

    let mut operations = Vec::new();
    for definition in &document.definitions {
        if let Definition::Operation(op) = definition {
            let (name, kind) = match op {
                OperationDefinition::SelectionSet(_) => (None, OperationKind::Query),
                OperationDefinition::Query(q) => (q.name.as_deref(), OperationKind::Query),
                OperationDefinition::Mutation(m) => (m.name.as_deref(), OperationKind::Mutation),
                OperationDefinition::Subscription(s) => {
                    (s.name.as_deref(), OperationKind::Subscription)
                }
            };
            operations.push((name, kind));
        }
    }

    match operation_name {
        Some(wanted) => operations
            .iter()
            .find(|(name, _)| *name == Some(wanted))
            .map(|(_, kind)| *kind)
            .ok_or_else(|| format!("Unknown operation named \"{}\"", wanted)),
        None => match operations.as_slice() {
            [(_, kind)] => Ok(*kind),
            [] => Err("Document does not contain an operation".to_string()),
            _ => Err("Must provide operation name if query contains multiple operations".to_string()),
        },
    }
}

pub fn is_subscription(query: &str, operation_name: Option<&str>) -> Result<bool, String> {
    Ok(operation_kind(query, operation_name)? == OperationKind::Subscription)
}

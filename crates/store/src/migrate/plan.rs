//! Migration ordering.
//!
//! Models migrate dependencies-first. The order is a topological sort over
//! each schema's `depends_on` list; a dependency cycle is a configuration
//! error caught before any migration runs.

use crate::error::{Error, Result};
use crate::schema::{ModelId, ModelSchema};
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Dependency-first ordering of the given schemas.
///
/// Dependencies on models outside the registered set are skipped; they are
/// owned by another store and migrate there.
pub(crate) fn order(schemas: &[ModelSchema]) -> Result<Vec<ModelId>> {
    let by_id: HashMap<&ModelId, &ModelSchema> =
        schemas.iter().map(|schema| (&schema.id, schema)).collect();

    let mut marks: HashMap<ModelId, Mark> = HashMap::new();
    let mut out = Vec::with_capacity(schemas.len());

    for schema in schemas {
        visit(schema, &by_id, &mut marks, &mut out)?;
    }
    Ok(out)
}

fn visit(
    schema: &ModelSchema,
    by_id: &HashMap<&ModelId, &ModelSchema>,
    marks: &mut HashMap<ModelId, Mark>,
    out: &mut Vec<ModelId>,
) -> Result<()> {
    match marks.get(&schema.id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            return Err(Error::Config(format!(
                "dependency cycle through model '{}'",
                schema.id
            )));
        }
        None => {}
    }

    marks.insert(schema.id.clone(), Mark::Visiting);
    for dependency in &schema.depends_on {
        if let Some(dependency) = by_id.get(dependency) {
            visit(dependency, by_id, marks, out)?;
        }
    }
    marks.insert(schema.id.clone(), Mark::Done);
    out.push(schema.id.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(id: &str, deps: &[&str]) -> ModelSchema {
        ModelSchema::new(id, 1, vec![])
            .depends_on(deps.iter().map(|d| ModelId::new(*d)).collect())
    }

    #[test]
    fn test_dependencies_come_first() {
        let schemas = vec![
            schema("order", &["user", "product"]),
            schema("product", &[]),
            schema("user", &[]),
        ];
        let order = order(&schemas).unwrap();

        let pos = |id: &str| order.iter().position(|m| m.as_str() == id).unwrap();
        assert!(pos("user") < pos("order"));
        assert!(pos("product") < pos("order"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let schemas = vec![schema("a", &["b"]), schema("b", &["a"])];
        assert!(matches!(order(&schemas), Err(Error::Config(_))));
    }

    #[test]
    fn test_unregistered_dependency_is_skipped() {
        let schemas = vec![schema("a", &["external"])];
        let order = order(&schemas).unwrap();
        assert_eq!(order.len(), 1);
    }
}

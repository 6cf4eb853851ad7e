pub mod database;
pub mod json_files;
pub mod memory;

use crate::error::{CoreError, Result};
use crate::host::{BookFields, Library};
use crate::models::{BookRecord, FieldKind, FieldValue};
use crate::template::{TemplateEvaluator, Templates};

/// Resolve a field of a stored record, evaluating composite columns.
pub(crate) fn resolve_field(
    library: &dyn Library,
    record: &BookRecord,
    field: &str,
) -> Result<Option<FieldValue>> {
    let meta = library
        .field_metadata(field)
        .ok_or_else(|| CoreError::UnknownField(field.to_string()))?;

    if meta.kind == FieldKind::Composite {
        let template = meta.template.as_deref().unwrap_or_default();
        let fields = BookFields {
            library,
            book_id: record.id,
            value: None,
        };
        let rendered = Templates::new().eval(template, &fields, "");
        return Ok(Some(FieldValue::Text(rendered)).filter(|v| !v.is_empty()));
    }

    Ok(record.raw_field(field))
}

/// A composite column may not reference itself.
pub(crate) fn check_composite(meta: &crate::models::FieldMetadata) -> Result<()> {
    if meta.kind != FieldKind::Composite {
        return Ok(());
    }
    let template = meta
        .template
        .as_deref()
        .ok_or_else(|| CoreError::ValidationError(format!("{} has no template", meta.name)))?;
    Templates::new().compile(template)?;
    if template.contains(&format!("{{{}", meta.name)) {
        return Err(CoreError::ValidationError(format!(
            "composite column {} references itself",
            meta.name
        )));
    }
    Ok(())
}

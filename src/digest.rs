//! Row digest expressions
//!
//! A UDF-based digest hashes the concatenation of `name,value` pairs of every
//! non-excluded staging column, sorted by column name so that column order
//! never changes the digest.

use crate::ingest_mode::DigestGenStrategy;
use crate::logical::Expr;
use crate::models::{DataType, FieldType, SchemaDefinition};

/// Expression producing the digest of a staging row aliased `alias`
///
/// Returns `None` when the strategy produces no digest. `extra_exclusions`
/// lists staging columns owned by the ingest mode.
pub fn digest_expression(
    strategy: &DigestGenStrategy,
    staging: &SchemaDefinition,
    alias: &str,
    extra_exclusions: &[String],
) -> Option<Expr> {
    match strategy {
        DigestGenStrategy::NoDigestGen => None,
        DigestGenStrategy::UserProvided { field } => Some(Expr::col(alias, field)),
        DigestGenStrategy::UdfBased {
            udf_name,
            digest_field,
            type_conversion_udfs,
            excluded_fields,
        } => {
            let mut fields: Vec<_> = staging
                .fields()
                .iter()
                .filter(|f| {
                    f.name != *digest_field
                        && !excluded_fields.contains(&f.name)
                        && !extra_exclusions.contains(&f.name)
                })
                .collect();
            fields.sort_by(|a, b| a.name.cmp(&b.name));

            let mut parts = Vec::with_capacity(fields.len() * 2);
            for field in fields {
                let column = Expr::col(alias, &field.name);
                let value = match type_conversion_udfs.get(&field.data_type()) {
                    Some(udf) => Expr::func(udf, vec![column]),
                    None => Expr::cast(column, FieldType::of(DataType::Varchar)),
                };
                parts.push(Expr::string(field.name.clone()));
                parts.push(value);
            }
            Some(Expr::func(udf_name, vec![Expr::Concat(parts)]))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Field;
    use crate::sink::{AnsiSqlSink, SqlRenderer};

    fn schema(order: &[&str]) -> SchemaDefinition {
        SchemaDefinition::new(
            order
                .iter()
                .map(|name| match *name {
                    "id" => Field::new("id", DataType::Int).primary_key(),
                    "amount" => Field::new("amount", DataType::Double),
                    "day" => Field::new("day", DataType::Date),
                    other => Field::new(other, DataType::Varchar),
                })
                .collect(),
        )
        .unwrap()
    }

    fn render(expr: &Expr) -> String {
        SqlRenderer::new(&AnsiSqlSink).render_expr(expr).unwrap()
    }

    #[test]
    fn test_column_order_does_not_matter() {
        let strategy = DigestGenStrategy::udf_based("MD5", "digest");
        let a = digest_expression(&strategy, &schema(&["id", "name", "amount"]), "stage", &[]);
        let b = digest_expression(&strategy, &schema(&["amount", "id", "name"]), "stage", &[]);
        assert_eq!(a, b);
        assert_eq!(
            render(&a.unwrap()),
            "MD5(CONCAT('amount',CAST(stage.\"amount\" AS VARCHAR),'id',CAST(stage.\"id\" AS VARCHAR),'name',CAST(stage.\"name\" AS VARCHAR)))"
        );
    }

    #[test]
    fn test_type_converters_and_exclusions() {
        let strategy = DigestGenStrategy::udf_based("MD5", "digest")
            .with_type_conversion(DataType::Date, "DATE_TO_TEXT")
            .with_excluded_field("name");
        let expr = digest_expression(
            &strategy,
            &schema(&["id", "name", "day", "digest", "flag"]),
            "stage",
            &["flag".to_string()],
        )
        .unwrap();
        assert_eq!(
            render(&expr),
            "MD5(CONCAT('day',DATE_TO_TEXT(stage.\"day\"),'id',CAST(stage.\"id\" AS VARCHAR)))"
        );
    }

    #[test]
    fn test_user_provided_and_none() {
        let expr = digest_expression(
            &DigestGenStrategy::user_provided("digest"),
            &schema(&["id", "digest"]),
            "stage",
            &[],
        );
        assert_eq!(expr, Some(Expr::col("stage", "digest")));
        assert!(
            digest_expression(&DigestGenStrategy::NoDigestGen, &schema(&["id"]), "s", &[])
                .is_none()
        );
    }
}

//! Insert-to-update rewriting and large-object parameter binding

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::types::Value;

use super::splitter::{matching_paren, placeholders, split_top_level, Placeholder};

/// An insert rewritten into a keyed update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRewrite {
    /// The UPDATE statement
    pub sql: String,
    /// For each parameter of the update, the index of the insert parameter it takes
    pub param_order: Vec<usize>,
}

impl MergeRewrite {
    /// Reorder the insert's parameters for the update
    pub fn reorder(&self, params: &[Value]) -> Result<Vec<Value>> {
        self.param_order
            .iter()
            .map(|&idx| {
                params.get(idx).cloned().ok_or_else(|| {
                    Error::merge(format!(
                        "update needs insert parameter {} but only {} are bound",
                        idx + 1,
                        params.len()
                    ))
                })
            })
            .collect()
    }
}

fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let text = text.trim_start();
    let head = text.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = &text[keyword.len()..];
    let boundary = rest
        .chars()
        .next()
        .map_or(true, |c| c.is_whitespace() || c == '(');
    boundary.then_some(rest)
}

fn unquote(identifier: &str) -> &str {
    let id = identifier.trim();
    for (open, close) in [('"', '"'), ('`', '`'), ('[', ']')] {
        if let Some(inner) = id.strip_prefix(open).and_then(|s| s.strip_suffix(close)) {
            return inner;
        }
    }
    id
}

fn parenthesized(text: &str) -> Option<(&str, &str)> {
    let open = text.find('(')?;
    if !text[..open].trim().is_empty() {
        return None;
    }
    let close = matching_paren(text, open)?;
    Some((&text[open + 1..close], &text[close + 1..]))
}

/// Value expression with its placeholders renumbered
struct Rendered {
    text: String,
    params: Vec<usize>,
}

/// Rewrite placeholders of one value expression
///
/// `sequential_base` is the insert-wide index of the expression's first `?`;
/// `next_number` tracks the `$n` numbering of the update.
fn render_value(expr: &str, sequential_base: usize, next_number: &mut usize) -> Rendered {
    let mut text = String::with_capacity(expr.len());
    let mut params = Vec::new();
    let mut last = 0;
    let mut sequential = sequential_base;

    for Placeholder { range, number } in placeholders(expr) {
        text.push_str(&expr[last..range.start]);
        match number {
            Some(n) => {
                params.push(n.saturating_sub(1));
                *next_number += 1;
                text.push_str(&format!("${}", *next_number));
            }
            None => {
                params.push(sequential);
                text.push('?');
            }
        }
        sequential += 1;
        last = range.end;
    }
    text.push_str(&expr[last..]);
    Rendered { text, params }
}

/// Turn `INSERT INTO t (k, v) VALUES (a, b)` into `UPDATE t SET v = b WHERE k = a`
///
/// Anything after the VALUES list (such as an `ON CONFLICT` clause) is
/// dropped. Key columns are matched case-insensitively, ignoring identifier
/// quotes. Fails when there are no keys, a key is not among the inserted
/// columns, every column is a key, or the statement is not a single-row
/// insert.
pub fn rewrite_insert_as_update(sql: &str, keys: &[String]) -> Result<MergeRewrite> {
    if keys.is_empty() {
        return Err(Error::merge("no key fields declared for merge"));
    }
    let not_insert = || Error::merge(format!("cannot rewrite as update: {}", sql.trim()));

    let statement = sql.trim().trim_end_matches(';');
    let rest = strip_keyword(statement, "INSERT").ok_or_else(not_insert)?;
    let rest = strip_keyword(rest, "INTO").ok_or_else(not_insert)?.trim_start();

    let open = rest.find('(').ok_or_else(not_insert)?;
    let table = rest[..open].trim();
    if table.is_empty() {
        return Err(not_insert());
    }
    let (columns, rest) = parenthesized(&rest[open..]).ok_or_else(not_insert)?;
    let rest = strip_keyword(rest, "VALUES").ok_or_else(not_insert)?;
    let (values, _) = parenthesized(rest.trim_start()).ok_or_else(not_insert)?;

    let columns = split_top_level(columns, b',');
    let values = split_top_level(values, b',');
    if columns.len() != values.len() {
        return Err(Error::merge(format!(
            "{} columns but {} values in: {}",
            columns.len(),
            values.len(),
            sql.trim()
        )));
    }

    let is_key = |column: &str| keys.iter().any(|k| k.eq_ignore_ascii_case(unquote(column)));
    for key in keys {
        if !columns.iter().any(|c| unquote(c).eq_ignore_ascii_case(key)) {
            return Err(Error::merge(format!(
                "key field '{}' is not an inserted column of {}",
                key, table
            )));
        }
    }

    // Sequential `?` index of the first placeholder of each value.
    let mut bases = Vec::with_capacity(values.len());
    let mut seen = 0;
    for value in &values {
        bases.push(seen);
        seen += placeholders(value).len();
    }

    let mut next_number = 0;
    let mut param_order = Vec::new();
    let mut assignments = Vec::new();
    for (idx, column) in columns.iter().enumerate() {
        if is_key(column) {
            continue;
        }
        let rendered = render_value(values[idx], bases[idx], &mut next_number);
        param_order.extend(rendered.params);
        assignments.push(format!("{} = {}", column, rendered.text));
    }
    if assignments.is_empty() {
        return Err(Error::merge(format!(
            "every inserted column of {} is a key; nothing to update",
            table
        )));
    }

    let mut conditions = Vec::new();
    for key in keys {
        let Some(idx) = columns.iter().position(|c| unquote(c).eq_ignore_ascii_case(key)) else {
            continue;
        };
        let rendered = render_value(values[idx], bases[idx], &mut next_number);
        param_order.extend(rendered.params);
        conditions.push(format!("{} = {}", columns[idx], rendered.text));
    }

    Ok(MergeRewrite {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            table,
            assignments.join(", "),
            conditions.join(" AND ")
        ),
        param_order,
    })
}

/// Bind large-object values positionally in field order
///
/// A statement with twice as many placeholders as values (an upsert that
/// repeats its value list) is bound with two series. Statements without
/// placeholders get no parameters.
pub fn bind_lob_params(driver: &dyn Driver, sql: &str, lobs: &[Value]) -> Vec<Value> {
    let count = placeholders(sql).len();
    if count == 0 || lobs.is_empty() {
        return Vec::new();
    }
    let series = if count == 2 * lobs.len() { 2 } else { 1 };

    let mut params = Vec::with_capacity(count);
    for _ in 0..series {
        for value in lobs {
            let position = params.len() + 1;
            match value {
                Value::Bytes(data) => driver.set_blob(&mut params, position, data),
                Value::String(text) => driver.set_clob(&mut params, position, text),
                other => params.push(other.clone()),
            }
        }
    }
    params
}

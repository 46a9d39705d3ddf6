//! Closed-world `@KEY@` substitution.
//!
//! Every placeholder must be bound and every binding must be used; a mismatch
//! in either direction is a programming error caught at render time (and by
//! unit tests diffing the template against the parameter set). Values are
//! opaque: they are never rescanned, so a value containing placeholder-like
//! text cannot inject further expansion.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template placeholder @{0}@ has no bound parameter")]
    UnboundPlaceholder(String),

    #[error("parameter `{0}` is never used by the template")]
    UnusedParameter(String),
}

fn is_placeholder_char(c: char) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'
}

/// All placeholder names appearing in `template`.
pub fn placeholders(template: &str) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    let mut rest = template;
    while let Some(start) = rest.find('@') {
        let after = &rest[start + 1..];
        let name_len = after.chars().take_while(|c| is_placeholder_char(*c)).count();
        if name_len > 0 && after[name_len..].starts_with('@') {
            found.insert(after[..name_len].to_owned());
            rest = &after[name_len + 1..];
        } else {
            // A lone '@' is literal text.
            rest = after;
        }
    }
    found
}

/// Substitute every placeholder in one pass, enforcing the closed world.
pub fn render(
    template: &str,
    bindings: &BTreeMap<&str, String>,
) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(template.len());
    let mut used: BTreeSet<&str> = BTreeSet::new();
    let mut rest = template;

    while let Some(start) = rest.find('@') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let name_len = after.chars().take_while(|c| is_placeholder_char(*c)).count();
        if name_len > 0 && after[name_len..].starts_with('@') {
            let name = &after[..name_len];
            match bindings.get_key_value(name) {
                Some((key, value)) => {
                    used.insert(key);
                    output.push_str(value);
                }
                None => return Err(TemplateError::UnboundPlaceholder(name.to_owned())),
            }
            rest = &after[name_len + 1..];
        } else {
            output.push('@');
            rest = after;
        }
    }
    output.push_str(rest);

    for key in bindings.keys() {
        if !used.contains(key) {
            return Err(TemplateError::UnusedParameter((*key).to_owned()));
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, (*v).to_owned())).collect()
    }

    #[test]
    fn substitutes_bound_placeholders() {
        let out = render("host=@HOST@ user=@USER@", &bindings(&[("HOST", "a"), ("USER", "b")]))
            .unwrap();
        assert_eq!(out, "host=a user=b");
    }

    #[test]
    fn unbound_placeholder_is_an_error() {
        let err = render("@MISSING@", &bindings(&[])).unwrap_err();
        assert_eq!(err, TemplateError::UnboundPlaceholder("MISSING".to_owned()));
    }

    #[test]
    fn unused_parameter_is_an_error() {
        let err = render("no placeholders", &bindings(&[("SPARE", "x")])).unwrap_err();
        assert_eq!(err, TemplateError::UnusedParameter("SPARE".to_owned()));
    }

    #[test]
    fn values_are_opaque_and_never_reexpanded() {
        let out = render(
            "v=@VALUE@",
            &bindings(&[("VALUE", "literal @VALUE@ inside")]),
        )
        .unwrap();
        assert_eq!(out, "v=literal @VALUE@ inside");
    }

    #[test]
    fn lone_at_signs_are_literal() {
        let out = render(
            "mail me @ home, cc @WHO@",
            &bindings(&[("WHO", "root")]),
        )
        .unwrap();
        assert_eq!(out, "mail me @ home, cc root");
    }

    #[test]
    fn placeholder_scan_matches_render() {
        let template = "a=@A@ b=@B_2@ plain@text";
        let names = placeholders(template);
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["A".to_owned(), "B_2".to_owned()]
        );
    }
}

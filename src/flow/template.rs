use std::{collections::HashMap, sync::LazyLock};

use regex::{Captures, Regex};

static PLACEHOLDER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").ok());

/// Substitutes `{{name}}` tokens from `variables`.
///
/// Unknown names are left in place verbatim so a missing variable shows up
/// in the sent text instead of silently disappearing.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let Some(re) = PLACEHOLDER.as_ref() else {
        return template.to_string();
    };
    if !template.contains("{{") {
        return template.to_string();
    }
    re.replace_all(template, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_substitutes_known_variables() {
        let out = render("Hi {{name}}, your code is {{ code }}.", &vars(&[("name", "Ana"), ("code", "42")]));
        assert_eq!(out, "Hi Ana, your code is 42.");
    }

    #[test]
    fn test_missing_variables_stay_verbatim() {
        let out = render("Hi {{name}}, order {{order_id}}", &vars(&[("name", "Ana")]));
        assert_eq!(out, "Hi Ana, order {{order_id}}");
    }

    #[test]
    fn test_plain_text_is_untouched() {
        assert_eq!(render("no tokens {here}", &HashMap::new()), "no tokens {here}");
    }
}

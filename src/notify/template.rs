// Webhook Templates
//
// Minimal interpolation for notification bodies: `{{name}}` substitutes a
// variable, `{{#if var}}...{{/if}}` keeps its body only when the variable
// is present, non-empty and not the string "false". Conditionals nest.

use std::collections::HashMap;

pub struct WebhookTemplateEngine;

impl WebhookTemplateEngine {
    pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
        let conditionals = Self::render_conditionals(template, vars);
        Self::render_vars(&conditionals, vars)
    }

    fn truthy(vars: &HashMap<String, String>, name: &str) -> bool {
        match vars.get(name) {
            Some(value) => !value.is_empty() && value != "false",
            None => false,
        }
    }

    fn render_conditionals(input: &str, vars: &HashMap<String, String>) -> String {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(open) = rest.find("{{#if ") {
            output.push_str(&rest[..open]);
            let after_open = &rest[open + "{{#if ".len()..];
            let name_end = match after_open.find("}}") {
                Some(i) => i,
                None => {
                    // Unterminated tag: emit as-is.
                    output.push_str(&rest[open..]);
                    return output;
                }
            };
            let name = after_open[..name_end].trim();
            let body_start = &after_open[name_end + 2..];

            // Find the matching {{/if}}, accounting for nesting.
            let mut depth = 1usize;
            let mut cursor = 0usize;
            let mut body_len = None;
            while cursor < body_start.len() {
                let slice = &body_start[cursor..];
                let next_open = slice.find("{{#if ");
                let next_close = slice.find("{{/if}}");
                match (next_open, next_close) {
                    (Some(o), Some(c)) if o < c => {
                        depth += 1;
                        cursor += o + "{{#if ".len();
                    }
                    (_, Some(c)) => {
                        depth -= 1;
                        if depth == 0 {
                            body_len = Some(cursor + c);
                            cursor += c + "{{/if}}".len();
                            break;
                        }
                        cursor += c + "{{/if}}".len();
                    }
                    _ => break,
                }
            }

            match body_len {
                Some(len) => {
                    let body = &body_start[..len];
                    if Self::truthy(vars, name) {
                        output.push_str(&Self::render_conditionals(body, vars));
                    }
                    rest = &body_start[cursor..];
                }
                None => {
                    // No closing tag: emit as-is.
                    output.push_str(&rest[open..]);
                    return output;
                }
            }
        }
        output.push_str(rest);
        output
    }

    fn render_vars(input: &str, vars: &HashMap<String, String>) -> String {
        let mut output = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(open) = rest.find("{{") {
            output.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find("}}") {
                Some(close) => {
                    let name = after[..close].trim();
                    match vars.get(name) {
                        Some(value) => output.push_str(value),
                        None => {
                            // Unknown variables render empty.
                        }
                    }
                    rest = &after[close + 2..];
                }
                None => {
                    output.push_str(&rest[open..]);
                    return output;
                }
            }
        }
        output.push_str(rest);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_simple_interpolation() {
        let rendered = WebhookTemplateEngine::render(
            "key {{key}} used {{credits}} credits",
            &vars(&[("key", "tg_a"), ("credits", "5")]),
        );
        assert_eq!(rendered, "key tg_a used 5 credits");
    }

    #[test]
    fn test_unknown_variable_renders_empty() {
        let rendered = WebhookTemplateEngine::render("hello {{nobody}}!", &vars(&[]));
        assert_eq!(rendered, "hello !");
    }

    #[test]
    fn test_conditional_elision() {
        let template = "alert{{#if reason}} because {{reason}}{{/if}}";
        assert_eq!(
            WebhookTemplateEngine::render(template, &vars(&[("reason", "quota")])),
            "alert because quota"
        );
        assert_eq!(WebhookTemplateEngine::render(template, &vars(&[])), "alert");
        assert_eq!(
            WebhookTemplateEngine::render(template, &vars(&[("reason", "")])),
            "alert"
        );
        assert_eq!(
            WebhookTemplateEngine::render(template, &vars(&[("reason", "false")])),
            "alert"
        );
    }

    #[test]
    fn test_nested_conditionals() {
        let template = "{{#if a}}A{{#if b}}B{{/if}}{{/if}}";
        assert_eq!(
            WebhookTemplateEngine::render(template, &vars(&[("a", "1"), ("b", "1")])),
            "AB"
        );
        assert_eq!(
            WebhookTemplateEngine::render(template, &vars(&[("a", "1")])),
            "A"
        );
        assert_eq!(WebhookTemplateEngine::render(template, &vars(&[("b", "1")])), "");
    }

    #[test]
    fn test_unterminated_tags_pass_through() {
        assert_eq!(
            WebhookTemplateEngine::render("{{#if x}}no close", &vars(&[("x", "1")])),
            "{{#if x}}no close"
        );
        assert_eq!(WebhookTemplateEngine::render("open {{name", &vars(&[])), "open {{name");
    }
}

//! Known-failure (xfail) rule resolution.
//!
//! Rules are matched in declaration order against the leaf's context tuple;
//! the first match wins and its issue id classifies the leaf as expected to
//! fail. Absent rule fields are wildcards.

use crate::core::types::{ConfigError, XfailRule};

/// The tuple an xfail rule is matched against.
#[derive(Debug, Clone)]
pub struct XfailContext<'a> {
    pub compatibility: &'a str,
    pub branch: &'a str,
    pub platform: &'a str,
    /// Resolved build configuration, when one is known (CLI override or the
    /// action's own field). Only consulted when a rule constrains it.
    pub configuration: Option<&'a str>,
    pub job: &'a str,
}

/// Return the first matching rule's issue id, or `None` when no rule
/// matches. A rule constraining `configuration` when none is resolvable is
/// a fatal configuration error.
pub fn resolve(
    rules: &[XfailRule],
    ctx: &XfailContext<'_>,
) -> Result<Option<String>, ConfigError> {
    for rule in rules {
        if let Some(issue) = match_rule(rule, ctx)? {
            return Ok(Some(issue));
        }
    }
    Ok(None)
}

fn match_rule(rule: &XfailRule, ctx: &XfailContext<'_>) -> Result<Option<String>, ConfigError> {
    let issue = issue_id(&rule.issue).to_string();

    let configuration = match &rule.configuration {
        Some(required) => {
            let resolved = ctx
                .configuration
                .ok_or_else(|| ConfigError::MissingConfiguration {
                    issue: issue.clone(),
                })?;
            Some((required, resolved.to_lowercase()))
        }
        None => None,
    };
    if let Some((required, resolved)) = configuration
        && !required.contains(&resolved)
    {
        return Ok(None);
    }

    let checks = [
        (&rule.compatibility, ctx.compatibility),
        (&rule.branch, ctx.branch),
        (&rule.platform, ctx.platform),
        (&rule.job, ctx.job),
    ];
    for (required, current) in checks {
        if let Some(required) = required
            && !required.contains(current)
        {
            return Ok(None);
        }
    }
    Ok(Some(issue))
}

/// The issue id is the first whitespace-separated token, so issue fields may
/// carry trailing notes.
fn issue_id(issue: &str) -> &str {
    issue.split_whitespace().next().unwrap_or(issue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::OneOrMany;

    fn rule(issue: &str) -> XfailRule {
        XfailRule {
            issue: issue.to_string(),
            compatibility: None,
            branch: None,
            platform: None,
            configuration: None,
            job: None,
        }
    }

    fn ctx<'a>() -> XfailContext<'a> {
        XfailContext {
            compatibility: "5.0",
            branch: "main",
            platform: "Linux",
            configuration: None,
            job: "source-compat",
        }
    }

    #[test]
    fn wildcard_rule_matches_any_context() {
        let rules = [rule("SR-100")];
        assert_eq!(resolve(&rules, &ctx()).unwrap().as_deref(), Some("SR-100"));
    }

    #[test]
    fn first_matching_rule_wins_on_overlap() {
        let mut first = rule("SR-1");
        first.branch = Some(OneOrMany::One("main".to_string()));
        let second = rule("SR-2");
        assert_eq!(
            resolve(&[first, second], &ctx()).unwrap().as_deref(),
            Some("SR-1")
        );
    }

    #[test]
    fn no_rule_matching_any_field_returns_none() {
        let mut branch_gated = rule("SR-1");
        branch_gated.branch = Some(OneOrMany::One("release/6.0".to_string()));
        let mut platform_gated = rule("SR-2");
        platform_gated.platform = Some(OneOrMany::One("Darwin".to_string()));
        assert_eq!(resolve(&[branch_gated, platform_gated], &ctx()).unwrap(), None);
    }

    #[test]
    fn list_valued_fields_match_any_of() {
        let mut listed = rule("SR-3");
        listed.compatibility = Some(OneOrMany::Many(vec![
            "4.2".to_string(),
            "5.0".to_string(),
        ]));
        assert_eq!(resolve(&[listed], &ctx()).unwrap().as_deref(), Some("SR-3"));
    }

    #[test]
    fn issue_id_is_first_token() {
        let rules = [rule("SR-9999 crashes since the 5.0 rebranch")];
        assert_eq!(resolve(&rules, &ctx()).unwrap().as_deref(), Some("SR-9999"));
    }

    #[test]
    fn configuration_is_compared_lowercase() {
        let mut gated = rule("SR-4");
        gated.configuration = Some(OneOrMany::One("debug".to_string()));
        let mut context = ctx();
        context.configuration = Some("Debug");
        assert_eq!(
            resolve(&[gated], &context).unwrap().as_deref(),
            Some("SR-4")
        );
    }

    #[test]
    fn configuration_constraint_without_resolved_value_is_fatal() {
        let mut gated = rule("SR-5");
        gated.configuration = Some(OneOrMany::One("debug".to_string()));
        let err = resolve(&[gated], &ctx()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::MissingConfiguration {
                issue: "SR-5".to_string()
            }
        );
    }

    #[test]
    fn mismatched_configuration_skips_rule() {
        let mut gated = rule("SR-6");
        gated.configuration = Some(OneOrMany::One("release".to_string()));
        let fallback = rule("SR-7");
        let mut context = ctx();
        context.configuration = Some("Debug");
        assert_eq!(
            resolve(&[gated, fallback], &context).unwrap().as_deref(),
            Some("SR-7")
        );
    }
}

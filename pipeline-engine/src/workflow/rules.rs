// Rule Matching
// First-match evaluation of `rules:` lists, shared by workflow and job rules

use crate::expression::{ExpressionContext, ExpressionEngine, ExpressionError};
use crate::model::Rule;

/// Return the first rule whose condition holds (a rule without `if:` always
/// holds), or `None` when nothing matches.
pub fn first_match<'r>(
    rules: &'r [Rule],
    context: &ExpressionContext,
) -> Result<Option<&'r Rule>, ExpressionError> {
    for rule in rules {
        let matched = match &rule.condition {
            None => true,
            Some(condition) => ExpressionEngine::evaluate(condition, context)?,
        };

        if matched {
            return Ok(Some(rule));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::When;

    #[test]
    fn test_first_match_wins() {
        let rules = vec![
            Rule::when_if("$A", When::Always),
            Rule::when_if("$B", When::Never),
            Rule::otherwise(When::OnFailure),
        ];

        let context = ExpressionContext::new(
            [("A".to_string(), "1".to_string()), ("B".to_string(), "1".to_string())]
                .into_iter()
                .collect(),
        );
        let rule = first_match(&rules, &context).unwrap().unwrap();
        assert_eq!(rule.when, Some(When::Always));

        let rule = first_match(&rules, &ExpressionContext::default())
            .unwrap()
            .unwrap();
        assert_eq!(rule.when, Some(When::OnFailure));
    }

    #[test]
    fn test_no_match() {
        let rules = vec![Rule::when_if("$A", When::Always)];
        assert!(first_match(&rules, &ExpressionContext::default())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_bad_condition_propagates() {
        let rules = vec![Rule::when_if("$A ==", When::Always)];
        assert!(first_match(&rules, &ExpressionContext::default()).is_err());
    }
}

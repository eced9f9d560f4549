//! HTTP path templates in the `google.api.http` grammar:
//!
//! ```text
//! Template = "/" Segments [ Verb ] ;
//! Segments = Segment { "/" Segment } ;
//! Segment  = "*" | "**" | LITERAL | Variable ;
//! Variable = "{" FieldPath [ "=" Segments ] "}" ;
//! Verb     = ":" LITERAL ;
//! ```
use percent_encoding::percent_decode_str;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error)]
#[error("Invalid path template '{template}': {reason}")]
pub struct TemplateError {
    pub template: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// `*`: exactly one segment.
    Single,
    /// `**`: zero or more trailing segments.
    Multi,
}

/// A `{field.path}` capture spanning `segments[start..end]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    pub field_path: String,
    start: usize,
    end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
    variables: Vec<Variable>,
    verb: Option<String>,
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for PathTemplate {
    type Err = TemplateError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        PathTemplate::parse(raw)
    }
}

impl PathTemplate {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let fail = |reason: &str| TemplateError {
            template: raw.to_string(),
            reason: reason.to_string(),
        };

        let Some(body) = raw.strip_prefix('/') else {
            return Err(fail("must start with '/'"));
        };

        // The verb is a ':' after the last '/' that is not inside a variable.
        let (body, verb) = match body.rfind(':') {
            Some(colon) if !body[colon..].contains(['/', '}']) => {
                let verb = &body[colon + 1..];
                if verb.is_empty() {
                    return Err(fail("empty verb"));
                }
                (&body[..colon], Some(verb.to_string()))
            }
            _ => (body, None),
        };

        let mut segments = Vec::new();
        let mut variables = Vec::new();
        let mut rest = body;

        while !rest.is_empty() || segments.is_empty() {
            if let Some(inner) = rest.strip_prefix('{') {
                let close = inner.find('}').ok_or_else(|| fail("unclosed variable"))?;
                let variable = &inner[..close];
                rest = &inner[close + 1..];

                let (field_path, sub) = match variable.split_once('=') {
                    Some((field_path, sub)) => (field_path, sub),
                    None => (variable, "*"),
                };
                if field_path.is_empty()
                    || !field_path
                        .split('.')
                        .all(|part| !part.is_empty() && part.chars().all(is_ident_char))
                {
                    return Err(fail("invalid variable field path"));
                }
                if variables.iter().any(|v: &Variable| v.field_path == field_path) {
                    return Err(fail("variable bound twice"));
                }

                let start = segments.len();
                for part in sub.split('/') {
                    match part {
                        "" => return Err(fail("empty segment")),
                        "*" => segments.push(Segment::Single),
                        "**" => segments.push(Segment::Multi),
                        literal if literal.contains(['{', '}', '=']) => {
                            return Err(fail("nested variables are not allowed"));
                        }
                        literal => segments.push(Segment::Literal(literal.to_string())),
                    }
                }
                variables.push(Variable {
                    field_path: field_path.to_string(),
                    start,
                    end: segments.len(),
                });
            } else {
                let end = rest.find('/').unwrap_or(rest.len());
                match &rest[..end] {
                    "" => return Err(fail("empty segment")),
                    "*" => segments.push(Segment::Single),
                    "**" => segments.push(Segment::Multi),
                    literal if literal.contains(['{', '}', '=']) => {
                        return Err(fail("malformed segment"));
                    }
                    literal => segments.push(Segment::Literal(literal.to_string())),
                }
                rest = &rest[end..];
            }

            match rest.strip_prefix('/') {
                Some(next) if next.is_empty() => return Err(fail("trailing '/'")),
                Some(next) => rest = next,
                None if rest.is_empty() => break,
                None => return Err(fail("expected '/' between segments")),
            }
        }

        if let Some(position) = segments.iter().position(|s| *s == Segment::Multi)
            && position + 1 != segments.len()
        {
            return Err(fail("'**' must be the last segment"));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            variables,
            verb,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    pub fn verb(&self) -> Option<&str> {
        self.verb.as_deref()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of literal segments, used to try more specific templates first.
    pub fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }

    /// Matches a request path, returning the percent-decoded captures by field path.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let body = path.strip_prefix('/')?;

        let body = match &self.verb {
            Some(verb) => body.strip_suffix(verb.as_str())?.strip_suffix(':')?,
            None => body,
        };

        let parts: Vec<&str> = body.split('/').collect();
        let multi = self.segments.last() == Some(&Segment::Multi);

        if multi {
            if parts.len() < self.segments.len() - 1 {
                return None;
            }
        } else if parts.len() != self.segments.len() {
            return None;
        }

        for (segment, part) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Literal(literal) if literal != part => return None,
                Segment::Single if part.is_empty() => return None,
                _ => {}
            }
        }

        let captures = self
            .variables
            .iter()
            .map(|variable| {
                let end = if variable.end == self.segments.len() && multi {
                    parts.len()
                } else {
                    variable.end
                };
                let raw = parts[variable.start.min(parts.len())..end].join("/");
                let value = percent_decode_str(&raw).decode_utf8_lossy().into_owned();
                (variable.field_path.clone(), value)
            })
            .collect();

        Some(captures)
    }

    /// Whether some request path could match both templates.
    pub fn overlaps(&self, other: &PathTemplate) -> bool {
        match (&self.verb, &other.verb) {
            (Some(a), Some(b)) if a != b => return false,
            // A trailing variable captures ":verb" as part of its value.
            (None, Some(_)) if !self.absorbs_verb() => return false,
            (Some(_), None) if !other.absorbs_verb() => return false,
            _ => {}
        }

        let mut left = self.segments.iter();
        let mut right = other.segments.iter();

        loop {
            match (left.next(), right.next()) {
                (None, None) => return true,
                (Some(Segment::Multi), _) | (_, Some(Segment::Multi)) => return true,
                (None, Some(_)) | (Some(_), None) => return false,
                (Some(Segment::Literal(a)), Some(Segment::Literal(b))) if a != b => return false,
                _ => {}
            }
        }
    }

    fn absorbs_verb(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Single | Segment::Multi))
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(raw: &str) -> PathTemplate {
        PathTemplate::parse(raw).unwrap()
    }

    #[test]
    fn captures_simple_variables() {
        let captures = template("/v1/users/{id}").matches("/v1/users/42").unwrap();
        assert_eq!(captures, vec![("id".to_string(), "42".to_string())]);

        assert!(template("/v1/users/{id}").matches("/v1/users").is_none());
        assert!(template("/v1/users/{id}").matches("/v1/users/42/x").is_none());
        assert!(template("/v1/users/{id}").matches("/v1/users/").is_none());
    }

    #[test]
    fn captures_nested_field_paths_and_sub_templates() {
        let t = template("/v1/{name=projects/*/books/*}:publish");
        let captures = t.matches("/v1/projects/p1/books/b%202:publish").unwrap();

        assert_eq!(
            captures,
            vec![("name".to_string(), "projects/p1/books/b 2".to_string())]
        );
        assert!(t.matches("/v1/projects/p1/books/b2").is_none());
        assert_eq!(t.verb(), Some("publish"));
    }

    #[test]
    fn double_wildcard_swallows_the_rest() {
        let t = template("/v1/files/{path=**}");

        let captures = t.matches("/v1/files/a/b/c.txt").unwrap();
        assert_eq!(captures, vec![("path".to_string(), "a/b/c.txt".to_string())]);
        assert!(t.matches("/v2/files/a").is_none());
    }

    #[test]
    fn verbs_on_bare_variables() {
        let t = template("/v1/echo/{message}:stream");
        let captures = t.matches("/v1/echo/hello:stream").unwrap();

        assert_eq!(captures, vec![("message".to_string(), "hello".to_string())]);
        assert!(t.matches("/v1/echo/hello").is_none());
    }

    #[test]
    fn rejects_malformed_templates() {
        for raw in [
            "v1/users",
            "/v1/users/",
            "/v1//users",
            "/v1/{id",
            "/v1/{}",
            "/v1/**/users",
            "/v1/{a}/{a}",
            "/v1/users:",
            "/v1/{a={b}}",
        ] {
            assert!(PathTemplate::parse(raw).is_err(), "accepted {raw}");
        }
    }

    #[test]
    fn detects_overlaps() {
        let by_id = template("/v1/users/{id}");

        assert!(by_id.overlaps(&template("/v1/users/me")));
        assert!(by_id.overlaps(&template("/v1/{collection}/{id}")));
        assert!(by_id.overlaps(&template("/v1/**")));
        assert!(!by_id.overlaps(&template("/v1/users")));
        assert!(!by_id.overlaps(&template("/v1/teams/{id}")));
        assert!(by_id.overlaps(&template("/v1/users/{id}:stream")));
    }

    #[test]
    fn trailing_variables_overlap_verbs() {
        let by_id = template("/v1/things/{id}");
        let action = template("/v1/things/{id}:do");

        // Both match the same request path.
        assert!(by_id.matches("/v1/things/x:do").is_some());
        assert!(action.matches("/v1/things/x:do").is_some());
        assert!(by_id.overlaps(&action));
        assert!(action.overlaps(&by_id));
        assert!(template("/v1/**").overlaps(&template("/v1/things/me:do")));

        assert!(!template("/v1/things/me").overlaps(&action));
        assert!(!template("/v1/{id}:undo").overlaps(&template("/v1/{id}:do")));
    }

    #[test]
    fn literal_count_orders_specificity() {
        assert_eq!(template("/v1/users/me").literal_count(), 3);
        assert_eq!(template("/v1/users/{id}").literal_count(), 2);
    }
}

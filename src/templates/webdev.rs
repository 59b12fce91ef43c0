//! Static HTML/CSS analysis tests. No sandbox involved.

use std::sync::Arc;

use scraper::{Html, Selector};

use crate::models::TestResult;

use super::params::Params;
use super::{Template, TestFn, TestFuture, TestInvocation};

/// Builds the `webdev` template.
pub fn template() -> Template {
    Template::new("webdev", false)
        .register("has_tag", Arc::new(HasTag))
        .register("has_attribute", Arc::new(HasAttribute))
        .register("has_style", Arc::new(HasStyle))
        .register("has_forbidden_tag", Arc::new(HasForbiddenTag))
        .register("check_bootstrap_usage", Arc::new(CheckBootstrapUsage))
}

/// The HTML files a test looks at: the declared target file, or every
/// `.html`/`.htm` file in the submission.
fn html_sources<'a>(inv: &'a TestInvocation<'a>) -> Result<Vec<(&'a str, &'a str)>, TestResult> {
    if let Some(target) = inv.file {
        return match inv.files.get(target) {
            Some(content) => Ok(vec![(target, content.as_str())]),
            None => Err(TestResult::fail(format!(
                "Target file '{target}' not found in the submission"
            ))),
        };
    }

    let sources: Vec<(&str, &str)> = inv
        .files
        .iter()
        .filter(|(name, _)| name.ends_with(".html") || name.ends_with(".htm"))
        .map(|(name, content)| (name.as_str(), content.as_str()))
        .collect();

    if sources.is_empty() {
        Err(TestResult::fail("The submission contains no HTML files"))
    } else {
        Ok(sources)
    }
}

/// Proportional score for count-based checks:
/// `min(found, required) / required x 100` when `required > 0`.
fn count_score(found: usize, required: u64, what: &str) -> TestResult {
    if required == 0 {
        return TestResult::pass(format!("No minimum required for {what}; found {found}"));
    }
    if found as u64 >= required {
        return TestResult::pass(format!("Found {found} of {required} required {what}"));
    }
    if found == 0 {
        return TestResult::fail(format!("Found none of {required} required {what}"));
    }
    let score = found as f64 / required as f64 * 100.0;
    TestResult::partial(score, format!("Found {found} of {required} required {what}"))
}

fn parse_selector(selector: &str) -> Result<Selector, TestResult> {
    Selector::parse(selector)
        .map_err(|e| TestResult::error(format!("Invalid selector '{selector}': {e}")))
}

fn count_selector(inv: &TestInvocation<'_>, selector: &str) -> Result<usize, TestResult> {
    let parsed = parse_selector(selector)?;

    let sources = html_sources(inv)?;
    let mut found = 0;
    for (_, content) in sources {
        let document = Html::parse_document(content);
        found += document.select(&parsed).count();
    }
    Ok(found)
}

/// `has_tag(tag, required_count)`: counts elements across the HTML files.
struct HasTag;

impl TestFn for HasTag {
    fn required_parameters(&self) -> &'static [&'static str] {
        &["tag"]
    }

    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let params = Params::new(inv.parameters);
            let tag = match params.str("tag") {
                Ok(tag) => tag.to_string(),
                Err(e) => return e.into_result(),
            };
            let required = match params.opt_u64("required_count") {
                Ok(n) => n.unwrap_or(1),
                Err(e) => return e.into_result(),
            };

            match count_selector(&inv, &tag) {
                Ok(found) => count_score(found, required, &format!("<{tag}> elements")),
                Err(result) => result,
            }
        })
    }
}

/// `has_attribute(attribute, count)`: counts elements carrying an attribute.
struct HasAttribute;

impl TestFn for HasAttribute {
    fn required_parameters(&self) -> &'static [&'static str] {
        &["attribute"]
    }

    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let params = Params::new(inv.parameters);
            let attribute = match params.str("attribute") {
                Ok(attr) => attr.to_string(),
                Err(e) => return e.into_result(),
            };
            let required = match params.opt_u64("count") {
                Ok(n) => n.unwrap_or(1),
                Err(e) => return e.into_result(),
            };

            match count_selector(&inv, &format!("[{attribute}]")) {
                Ok(found) => count_score(
                    found,
                    required,
                    &format!("elements with the '{attribute}' attribute"),
                ),
                Err(result) => result,
            }
        })
    }
}

/// `has_style(property, count)`: counts declarations of a CSS property in
/// stylesheets, `<style>` blocks, and inline `style` attributes.
struct HasStyle;

impl TestFn for HasStyle {
    fn required_parameters(&self) -> &'static [&'static str] {
        &["property"]
    }

    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let params = Params::new(inv.parameters);
            let property = match params.str("property") {
                Ok(p) => p.to_string(),
                Err(e) => return e.into_result(),
            };
            let required = match params.opt_u64("count") {
                Ok(n) => n.unwrap_or(1),
                Err(e) => return e.into_result(),
            };

            let pattern = match regex::Regex::new(&format!(
                r"(?i)(^|[^-\w]){}\s*:",
                regex::escape(&property)
            )) {
                Ok(p) => p,
                Err(e) => return TestResult::error(format!("Invalid property pattern: {e}")),
            };

            let mut found = 0;

            // Standalone stylesheets.
            for (name, content) in inv.files {
                if inv.file.map(|f| f != name.as_str()).unwrap_or(false) {
                    continue;
                }
                if name.ends_with(".css") {
                    found += pattern.find_iter(content).count();
                }
            }

            // <style> blocks and inline style attributes.
            if let Ok(sources) = html_sources(&inv) {
                let style_blocks = match parse_selector("style") {
                    Ok(s) => s,
                    Err(result) => return result,
                };
                let styled = match parse_selector("[style]") {
                    Ok(s) => s,
                    Err(result) => return result,
                };
                for (_, content) in sources {
                    let document = Html::parse_document(content);
                    for element in document.select(&style_blocks) {
                        let css: String = element.text().collect();
                        found += pattern.find_iter(&css).count();
                    }
                    for element in document.select(&styled) {
                        if let Some(inline) = element.value().attr("style") {
                            found += pattern.find_iter(inline).count();
                        }
                    }
                }
            }

            count_score(
                found,
                required,
                &format!("'{property}' style declarations"),
            )
        })
    }
}

/// `has_forbidden_tag(tag)`: a penalty-family check. The score is the
/// penalty that accrues, so a detected violation scores 100 and a clean
/// submission scores 0.
struct HasForbiddenTag;

impl TestFn for HasForbiddenTag {
    fn required_parameters(&self) -> &'static [&'static str] {
        &["tag"]
    }

    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let params = Params::new(inv.parameters);
            let tag = match params.str("tag") {
                Ok(tag) => tag.to_string(),
                Err(e) => return e.into_result(),
            };

            match count_selector(&inv, &tag) {
                Ok(0) => TestResult::fail(format!("No forbidden <{tag}> elements found")),
                Ok(found) => TestResult::pass(format!(
                    "Found {found} forbidden <{tag}> element(s); penalty applied"
                )),
                Err(result) => result,
            }
        })
    }
}

/// `check_bootstrap_usage`: looks for a Bootstrap stylesheet include and
/// grid classes actually being used.
struct CheckBootstrapUsage;

impl TestFn for CheckBootstrapUsage {
    fn run<'a>(&'a self, inv: TestInvocation<'a>) -> TestFuture<'a> {
        Box::pin(async move {
            let sources = match html_sources(&inv) {
                Ok(sources) => sources,
                Err(result) => return result,
            };

            let (link, script, classed) = match (
                parse_selector("link[href*='bootstrap']"),
                parse_selector("script[src*='bootstrap']"),
                parse_selector("[class]"),
            ) {
                (Ok(link), Ok(script), Ok(classed)) => (link, script, classed),
                (Err(r), _, _) | (_, Err(r), _) | (_, _, Err(r)) => return r,
            };

            let mut included = false;
            let mut grid_classes = 0;

            for (_, content) in sources {
                let document = Html::parse_document(content);
                if document.select(&link).next().is_some()
                    || document.select(&script).next().is_some()
                {
                    included = true;
                }
                for element in document.select(&classed) {
                    if let Some(classes) = element.value().attr("class") {
                        grid_classes += classes
                            .split_whitespace()
                            .filter(|c| {
                                *c == "container"
                                    || *c == "container-fluid"
                                    || *c == "row"
                                    || c.starts_with("col-")
                                    || c.starts_with("btn")
                            })
                            .count();
                    }
                }
            }

            match (included, grid_classes) {
                (true, n) if n > 0 => TestResult::pass(format!(
                    "Bootstrap is included and used by {n} element class(es)"
                )),
                (true, 0) => TestResult::partial(
                    50.0,
                    "Bootstrap is included but no Bootstrap classes are used",
                ),
                (false, n) if n > 0 => TestResult::partial(
                    50.0,
                    format!("Bootstrap classes appear {n} time(s) but no Bootstrap stylesheet or script is included"),
                ),
                _ => TestResult::fail("No Bootstrap include or classes found"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ParameterConfig, TestStatus};
    use crate::templates::TestServices;
    use indexmap::IndexMap;
    use serde_json::json;

    fn files(entries: &[(&str, &str)]) -> IndexMap<String, String> {
        entries
            .iter()
            .map(|(name, content)| (name.to_string(), content.to_string()))
            .collect()
    }

    async fn run(
        test: &dyn TestFn,
        parameters: Vec<ParameterConfig>,
        files: &IndexMap<String, String>,
        target: Option<&str>,
    ) -> TestResult {
        let services = TestServices::new();
        test.run(TestInvocation {
            parameters: &parameters,
            file: target,
            files,
            sandbox: None,
            services: &services,
        })
        .await
    }

    #[tokio::test]
    async fn has_tag_partial_credit() {
        let files = files(&[(
            "index.html",
            "<html><body><article>a</article><article>b</article></body></html>",
        )]);
        let params = vec![
            ParameterConfig::new("tag", json!("article")),
            ParameterConfig::new("required_count", json!(4)),
        ];

        let result = run(&HasTag, params, &files, None).await;
        assert_eq!(result.status, TestStatus::Partial);
        assert!((result.score - 50.0).abs() < 1e-9);
        assert!(result.report.contains("2 of 4"));
    }

    #[tokio::test]
    async fn has_tag_pass_and_fail() {
        let files = files(&[("index.html", "<main><h1>Title</h1></main>")]);

        let pass = run(
            &HasTag,
            vec![ParameterConfig::new("tag", json!("h1"))],
            &files,
            None,
        )
        .await;
        assert_eq!(pass.status, TestStatus::Pass);
        assert_eq!(pass.score, 100.0);

        let fail = run(
            &HasTag,
            vec![ParameterConfig::new("tag", json!("footer"))],
            &files,
            None,
        )
        .await;
        assert_eq!(fail.status, TestStatus::Fail);
        assert_eq!(fail.score, 0.0);
    }

    #[tokio::test]
    async fn has_tag_respects_target_file() {
        let files = files(&[
            ("index.html", "<p>one</p>"),
            ("about.html", "<p>two</p><p>three</p>"),
        ]);
        let params = vec![
            ParameterConfig::new("tag", json!("p")),
            ParameterConfig::new("required_count", json!(2)),
        ];

        let scoped = run(&HasTag, params.clone(), &files, Some("about.html")).await;
        assert_eq!(scoped.status, TestStatus::Pass);

        let missing = run(&HasTag, params, &files, Some("nope.html")).await;
        assert_eq!(missing.status, TestStatus::Fail);
        assert!(missing.report.contains("nope.html"));
    }

    #[tokio::test]
    async fn has_attribute_counts_elements() {
        let files = files(&[(
            "index.html",
            "<img src='a.png' alt='a'><img src='b.png'><input alt='c'>",
        )]);
        let params = vec![
            ParameterConfig::new("attribute", json!("alt")),
            ParameterConfig::new("count", json!(3)),
        ];

        let result = run(&HasAttribute, params, &files, None).await;
        assert_eq!(result.status, TestStatus::Partial);
        assert!(result.report.contains("2 of 3"));
    }

    #[tokio::test]
    async fn has_style_searches_css_and_inline() {
        let files = files(&[
            ("style.css", "body { display: flex; }\n.nav { display: grid; }"),
            (
                "index.html",
                "<div style='display: block'>x</div><style>p { color: red; }</style>",
            ),
        ]);
        let params = vec![
            ParameterConfig::new("property", json!("display")),
            ParameterConfig::new("count", json!(3)),
        ];

        let result = run(&HasStyle, params, &files, None).await;
        assert_eq!(result.status, TestStatus::Pass);
        assert!(result.report.contains("3 of 3"));
    }

    #[tokio::test]
    async fn forbidden_tag_scores_the_penalty() {
        let files = files(&[("index.html", "<div><marquee>old</marquee></div>")]);
        let params = vec![ParameterConfig::new("tag", json!("marquee"))];

        // A detected violation scores the full penalty.
        let result = run(&HasForbiddenTag, params, &files, None).await;
        assert_eq!(result.score, 100.0);
        assert!(result.report.contains("penalty"));

        let clean = files_clean().await;
        assert_eq!(clean.score, 0.0);
    }

    async fn files_clean() -> TestResult {
        let files = files(&[("index.html", "<div>modern</div>")]);
        let params = vec![ParameterConfig::new("tag", json!("marquee"))];
        run(&HasForbiddenTag, params, &files, None).await
    }

    #[tokio::test]
    async fn bootstrap_check_grades_inclusion_and_usage() {
        let full = files(&[(
            "index.html",
            "<link rel='stylesheet' href='bootstrap.min.css'>\
             <div class='container'><div class='row'><div class='col-md-6'>x</div></div></div>",
        )]);
        let result = run(&CheckBootstrapUsage, vec![], &full, None).await;
        assert_eq!(result.status, TestStatus::Pass);

        let included_only = files(&[(
            "index.html",
            "<link rel='stylesheet' href='bootstrap.min.css'><div>x</div>",
        )]);
        let result = run(&CheckBootstrapUsage, vec![], &included_only, None).await;
        assert_eq!(result.status, TestStatus::Partial);

        let nothing = files(&[("index.html", "<div>x</div>")]);
        let result = run(&CheckBootstrapUsage, vec![], &nothing, None).await;
        assert_eq!(result.status, TestStatus::Fail);
    }
}

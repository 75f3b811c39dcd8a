//! Template engine based on MiniJinja

use berth_core::{Chart, ReleaseInfo, Values};
use minijinja::{AutoEscape, Environment};

use crate::error::{EngineError, Result, TemplateError};
use crate::filters;

/// Template engine builder
pub struct EngineBuilder {
    strict_mode: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self { strict_mode: true }
    }

    /// Set strict mode (fail on undefined variables)
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn build(self) -> Engine {
        Engine::new(self.strict_mode)
    }
}

/// The template engine
///
/// Rendering a chart yields one multi-document YAML string. Documents appear
/// in template name order so the same inputs always produce the same manifest.
#[derive(Debug, Clone)]
pub struct Engine {
    strict_mode: bool,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Engine {
    pub fn new(strict_mode: bool) -> Self {
        Self { strict_mode }
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    fn create_environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        // manifests are YAML, never HTML or JSON escaped
        env.set_auto_escape_callback(|_| AutoEscape::None);

        if self.strict_mode {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        } else {
            env.set_undefined_behavior(minijinja::UndefinedBehavior::Lenient);
        }

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("sha256", filters::sha256);
        env.add_filter("quote", filters::quote);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("indent", filters::indent);
        env.add_filter("required", filters::required);
        env.add_filter("trunc", filters::trunc);

        env
    }

    /// Render a single template string against `values` and `release`
    pub fn render_string(
        &self,
        template: &str,
        values: &Values,
        release: &ReleaseInfo,
        template_name: &str,
    ) -> Result<String> {
        let mut env = self.create_environment();
        env.add_template_owned(template_name.to_string(), template.to_string())
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        let tmpl = env
            .get_template(template_name)
            .map_err(|e| TemplateError::from_minijinja(e, template_name, template))?;

        let ctx = minijinja::context! {
            values => values.inner(),
            release => release,
        };

        tmpl.render(ctx)
            .map_err(|e| EngineError::Template(TemplateError::from_minijinja(e, template_name, template)))
    }

    /// Render every manifest template of `chart`
    ///
    /// `values` are user overrides merged over the chart defaults. Helper
    /// templates (file name starting with `_`) are loaded so they can be
    /// imported but produce no output, and `NOTES.txt` is skipped. Templates
    /// that render to nothing are left out.
    pub fn render_chart(&self, chart: &Chart, values: &Values, release: &ReleaseInfo) -> Result<String> {
        let mut env = self.create_environment();

        for (name, source) in &chart.templates {
            env.add_template_owned(name.clone(), source.clone())
                .map_err(|e| TemplateError::from_minijinja(e, name, source))?;
        }

        let effective = values.over(&chart.values);
        let ctx = minijinja::context! {
            values => effective.inner(),
            release => release,
            chart => &chart.metadata,
        };

        let mut output = String::new();
        for (name, source) in &chart.templates {
            if !is_manifest_template(name) {
                continue;
            }

            let tmpl = env
                .get_template(name)
                .map_err(|e| TemplateError::from_minijinja(e, name, source))?;
            let rendered = tmpl
                .render(&ctx)
                .map_err(|e| TemplateError::from_minijinja(e, name, source))?;

            let body = rendered.trim_start_matches('\n').trim_end();
            if body.is_empty() || body == "---" {
                continue;
            }

            output.push_str(&format!(
                "---\n# Source: {}/templates/{}\n{}\n",
                chart.metadata.name, name, body
            ));
        }

        Ok(output)
    }
}

fn is_manifest_template(name: &str) -> bool {
    let file_name = name.rsplit('/').next().unwrap_or(name);
    !file_name.starts_with('_') && !file_name.eq_ignore_ascii_case("NOTES.txt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::ChartMetadata;
    use semver::Version;

    fn test_chart() -> Chart {
        Chart::new(ChartMetadata::new("web", Version::new(1, 0, 0)))
            .with_values(Values::from_yaml("replicas: 1\nimage: nginx\ningress: false\n").unwrap())
            .with_template(
                "_helpers.tpl",
                "{% macro fullname(release) %}{{ release.name }}-web{% endmacro %}",
            )
            .with_template(
                "service.yaml",
                "{% from '_helpers.tpl' import fullname %}apiVersion: v1\nkind: Service\nmetadata:\n  name: {{ fullname(release) }}\n",
            )
            .with_template(
                "deployment.yaml",
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {{ release.name }}\nspec:\n  replicas: {{ values.replicas }}\n",
            )
            .with_template("ingress.yaml", "{% if values.ingress %}kind: Ingress{% endif %}")
            .with_template("NOTES.txt", "Installed {{ release.name }}")
    }

    #[test]
    fn test_render_simple() {
        let engine = Engine::default();
        let values = Values::from_yaml("replicas: 3").unwrap();
        let release = ReleaseInfo::for_install("myapp", "default", 1);

        let result = engine
            .render_string("replicas: {{ values.replicas }}", &values, &release, "test.yaml")
            .unwrap();
        assert_eq!(result, "replicas: 3");
    }

    #[test]
    fn test_render_chart_is_ordered_and_skips_helpers() {
        let engine = Engine::default();
        let release = ReleaseInfo::for_install("demo", "default", 1);
        let overrides = Values::from_yaml("replicas: 2").unwrap();

        let manifest = engine.render_chart(&test_chart(), &overrides, &release).unwrap();

        assert_eq!(
            manifest,
            "---\n# Source: web/templates/deployment.yaml\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: demo\nspec:\n  replicas: 2\n\
             ---\n# Source: web/templates/service.yaml\napiVersion: v1\nkind: Service\nmetadata:\n  name: demo-web\n"
        );
    }

    #[test]
    fn test_render_chart_is_deterministic() {
        let engine = Engine::default();
        let release = ReleaseInfo::for_install("demo", "default", 1);
        let chart = test_chart();

        let first = engine.render_chart(&chart, &Values::new(), &release).unwrap();
        let second = engine.render_chart(&chart, &Values::new(), &release).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("replicas: 1"));
    }

    #[test]
    fn test_undefined_error() {
        let engine = Engine::default();
        let release = ReleaseInfo::for_install("demo", "default", 1);
        let chart = Chart::new(ChartMetadata::new("web", Version::new(1, 0, 0)))
            .with_template("cm.yaml", "value: {{ values.missing.key }}");

        let err = engine.render_chart(&chart, &Values::new(), &release).unwrap_err();
        match err {
            EngineError::Template(e) => assert_eq!(e.template, "cm.yaml"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_lenient_mode() {
        let engine = Engine::builder().strict(false).build();
        let release = ReleaseInfo::for_install("demo", "default", 1);

        let result = engine
            .render_string("value: '{{ values.missing }}'", &Values::new(), &release, "t.yaml")
            .unwrap();
        assert_eq!(result, "value: ''");
    }
}

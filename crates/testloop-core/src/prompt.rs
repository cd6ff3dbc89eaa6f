use testloop_config::PromptTemplates;
use testloop_engine::GenerationRequest;
use thiserror::Error;

pub const SOURCE_PLACEHOLDER: &str = "<<SOURCE>>";
pub const HEADER_PLACEHOLDER: &str = "<<HEADER>>";
pub const CODE_PLACEHOLDER: &str = "<<CODE>>";
pub const LOG_PLACEHOLDER: &str = "<<LOG>>";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{template} template is missing placeholder {placeholder}")]
pub struct TemplateError {
    pub template: &'static str,
    pub placeholder: &'static str,
}

/// Turns unit payloads into generation requests. Holds no state besides the
/// validated templates.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    model: String,
    templates: PromptTemplates,
}

impl PromptComposer {
    pub fn new(
        model: impl Into<String>,
        templates: &PromptTemplates,
    ) -> Result<Self, TemplateError> {
        require(&templates.initial_user, "initial", SOURCE_PLACEHOLDER)?;
        require(&templates.initial_user, "initial", HEADER_PLACEHOLDER)?;
        require(&templates.refine_user, "refine", CODE_PLACEHOLDER)?;
        require(&templates.refine_user, "refine", LOG_PLACEHOLDER)?;
        Ok(Self {
            model: model.into(),
            templates: templates.clone(),
        })
    }

    pub fn compose_initial(&self, source: &str, header: &str) -> GenerationRequest {
        GenerationRequest {
            model: self.model.clone(),
            system: self.templates.initial_system.clone(),
            user: render(
                &self.templates.initial_user,
                &[(HEADER_PLACEHOLDER, header), (SOURCE_PLACEHOLDER, source)],
            ),
        }
    }

    pub fn compose_refinement(&self, previous_test: &str, build_log: &str) -> GenerationRequest {
        GenerationRequest {
            model: self.model.clone(),
            system: self.templates.refine_system.clone(),
            user: render(
                &self.templates.refine_user,
                &[(CODE_PLACEHOLDER, previous_test), (LOG_PLACEHOLDER, build_log)],
            ),
        }
    }
}

fn require(
    template: &str,
    name: &'static str,
    placeholder: &'static str,
) -> Result<(), TemplateError> {
    if template.contains(placeholder) {
        Ok(())
    } else {
        Err(TemplateError {
            template: name,
            placeholder,
        })
    }
}

/// Single-pass substitution: inserted values are never scanned again.
fn render(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let next = values
            .iter()
            .filter_map(|(key, value)| rest.find(key).map(|idx| (idx, *key, *value)))
            .min_by_key(|(idx, _, _)| *idx);
        match next {
            Some((idx, key, value)) => {
                out.push_str(&rest[..idx]);
                out.push_str(value);
                rest = &rest[idx + key.len()..];
            }
            None => {
                out.push_str(rest);
                return out;
            }
        }
    }
}

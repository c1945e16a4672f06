// Acceptance criteria extraction from task descriptions

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};
use regex::Regex;
use std::sync::OnceLock;

fn section_heading_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)^\s*(acceptance\s+criteria|acceptance\s+tests?|definition\s+of\s+done|requirements)\s*:?\s*$",
        )
        .expect("criteria heading regex is valid")
    })
}

/// Extract the list of pass/fail conditions from a task.
///
/// Sources, first non-empty wins:
/// 1. list items under an "Acceptance Criteria" (or "Requirements", "Definition of Done") heading
///    or bold label
/// 2. checklist items (`- [ ]`) anywhere in the description
/// 3. any bullet or numbered item
/// 4. a single criterion derived from the title
///
/// The result is deterministic for a given description and title.
pub fn extract_acceptance_criteria(description: &str, title: &str) -> Vec<String> {
    let items = collect_list_items(description);

    let in_section: Vec<String> = items
        .iter()
        .filter(|i| i.in_criteria_section)
        .map(|i| i.text.clone())
        .collect();
    if !in_section.is_empty() {
        return dedupe(in_section);
    }

    let checklist: Vec<String> = items
        .iter()
        .filter(|i| i.is_checklist)
        .map(|i| i.text.clone())
        .collect();
    if !checklist.is_empty() {
        return dedupe(checklist);
    }

    let bullets: Vec<String> = items.into_iter().map(|i| i.text).collect();
    if !bullets.is_empty() {
        return dedupe(bullets);
    }

    vec![fallback_criterion(title)]
}

fn fallback_criterion(title: &str) -> String {
    let title = title.trim();
    if title.is_empty() {
        "The task is implemented as described".to_string()
    } else {
        format!("The task \"{}\" is implemented as described", title)
    }
}

fn dedupe(items: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(items.len());
    for item in items {
        if !seen.contains(&item) {
            seen.push(item);
        }
    }
    seen
}

#[derive(Debug)]
struct ListItem {
    text: String,
    is_checklist: bool,
    in_criteria_section: bool,
}

#[derive(Debug, Default)]
struct OpenItem {
    text: String,
    is_checklist: bool,
}

#[derive(Debug, Default)]
struct ExtractorState {
    items: Vec<ListItem>,
    /// Nested list items currently open, innermost last
    open_items: Vec<OpenItem>,
    heading: Option<(HeadingLevel, String)>,
    /// Level of the heading that opened the criteria section, `None` for a bold label
    section: Option<Option<HeadingLevel>>,
    paragraph: Option<String>,
}

impl ExtractorState {
    fn handle_start_tag(&mut self, tag: Tag) {
        match tag {
            Tag::Heading { level, .. } => {
                // A heading at the same or higher level closes the section
                if let Some(section_level) = self.section {
                    match section_level {
                        Some(open) if level > open => {}
                        _ => self.section = None,
                    }
                }
                self.heading = Some((level, String::new()));
            }
            Tag::Item => self.open_items.push(OpenItem::default()),
            Tag::Paragraph if self.open_items.is_empty() => {
                self.paragraph = Some(String::new());
            }
            _ => {}
        }
    }

    fn handle_end_tag(&mut self, tag_end: TagEnd) {
        match tag_end {
            TagEnd::Heading(_) => {
                if let Some((level, text)) = self.heading.take() {
                    if section_heading_regex().is_match(&text) {
                        self.section = Some(Some(level));
                    }
                }
            }
            TagEnd::Item => {
                if let Some(item) = self.open_items.pop() {
                    let text = normalize(&item.text);
                    if !text.is_empty() {
                        self.items.push(ListItem {
                            text,
                            is_checklist: item.is_checklist,
                            in_criteria_section: self.section.is_some(),
                        });
                    }
                }
            }
            TagEnd::Paragraph => {
                if let Some(text) = self.paragraph.take() {
                    if section_heading_regex().is_match(&text) {
                        self.section = Some(None);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_text(&mut self, text: &str) {
        if let Some((_, heading)) = self.heading.as_mut() {
            heading.push_str(text);
        } else if let Some(item) = self.open_items.last_mut() {
            item.text.push_str(text);
        } else if let Some(paragraph) = self.paragraph.as_mut() {
            paragraph.push_str(text);
        }
    }

    fn handle_break(&mut self) {
        if let Some(item) = self.open_items.last_mut() {
            item.text.push(' ');
        }
    }

    fn handle_task_marker(&mut self) {
        if let Some(item) = self.open_items.last_mut() {
            item.is_checklist = true;
        }
    }
}

fn collect_list_items(description: &str) -> Vec<ListItem> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TASKLISTS);

    let mut state = ExtractorState::default();
    for event in Parser::new_ext(description, options) {
        match event {
            Event::Start(tag) => state.handle_start_tag(tag),
            Event::End(tag_end) => state.handle_end_tag(tag_end),
            Event::Text(text) | Event::Code(text) => state.handle_text(&text),
            Event::SoftBreak | Event::HardBreak => state.handle_break(),
            Event::TaskListMarker(_) => state.handle_task_marker(),
            _ => {}
        }
    }
    state.items
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acceptance_criteria_heading() {
        let description = r#"
Users need a login page.

- background note that is not a criterion

## Acceptance Criteria

- Login form renders email and password fields
- Invalid credentials show an error
- [x] Successful login redirects to `/dashboard`

## Notes

- Use the existing design system
"#;
        let criteria = extract_acceptance_criteria(description, "Login page");
        assert_eq!(
            criteria,
            vec![
                "Login form renders email and password fields",
                "Invalid credentials show an error",
                "Successful login redirects to /dashboard",
            ]
        );
    }

    #[test]
    fn test_bold_label_section() {
        let description = "Some context.\n\n**Acceptance criteria:**\n\n1. API returns 201\n2. Row is persisted\n";
        let criteria = extract_acceptance_criteria(description, "Create endpoint");
        assert_eq!(criteria, vec!["API returns 201", "Row is persisted"]);
    }

    #[test]
    fn test_subheadings_stay_in_section() {
        let description = "## Requirements\n\n### Backend\n\n- Add migration\n\n### Frontend\n\n- Add form\n\n## Out of scope\n\n- Emails\n";
        let criteria = extract_acceptance_criteria(description, "t");
        assert_eq!(criteria, vec!["Add migration", "Add form"]);
    }

    #[test]
    fn test_checklist_fallback() {
        let description = "Do the thing.\n\n- plain bullet\n- [ ] first check\n- [ ] second check\n";
        let criteria = extract_acceptance_criteria(description, "t");
        assert_eq!(criteria, vec!["first check", "second check"]);
    }

    #[test]
    fn test_bullet_fallback_and_nested_items() {
        let description = "- parent item\n  - child item\n- other item\n- other item\n";
        let criteria = extract_acceptance_criteria(description, "t");
        assert_eq!(criteria, vec!["child item", "parent item", "other item"]);
    }

    #[test]
    fn test_title_fallback() {
        assert_eq!(
            extract_acceptance_criteria("Just prose, no lists.", "Add dark mode"),
            vec!["The task \"Add dark mode\" is implemented as described"]
        );
        assert_eq!(
            extract_acceptance_criteria("", "  "),
            vec!["The task is implemented as described"]
        );
    }

    #[test]
    fn test_deterministic() {
        let description = "## Acceptance Criteria\n- a\n- b\n";
        assert_eq!(
            extract_acceptance_criteria(description, "x"),
            extract_acceptance_criteria(description, "x")
        );
    }
}

//! Lightweight owned XML tree for one materialised `<App>` subtree.

use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum XmlContent {
    Text(String),
    Element(XmlNode),
}

/// One element with its attributes and mixed content in document order.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub content: Vec<XmlContent>,
}

impl XmlNode {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), attributes: Vec::new(), content: Vec::new() }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.push_text(text.into());
        self
    }

    #[must_use]
    pub fn with_child(mut self, child: XmlNode) -> Self {
        self.content.push(XmlContent::Element(child));
        self
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// Append character data, merging with a preceding text run.
    pub fn push_text(&mut self, text: String) {
        if let Some(XmlContent::Text(existing)) = self.content.last_mut() {
            existing.push_str(&text);
        } else {
            self.content.push(XmlContent::Text(text));
        }
    }

    pub fn children(&self) -> impl Iterator<Item = &XmlNode> {
        self.content.iter().filter_map(|item| match item {
            XmlContent::Element(node) => Some(node),
            XmlContent::Text(_) => None,
        })
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children().filter(move |child| child.name == name)
    }

    #[must_use]
    pub fn has_children(&self) -> bool {
        self.children().next().is_some()
    }

    /// Direct character data, trimmed. Text inside child elements is not included.
    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::new();
        for item in &self.content {
            if let XmlContent::Text(text) = item {
                out.push_str(text);
            }
        }
        out.trim().to_string()
    }

    /// Character data with child elements rendered as markup, e.g. `With <p1/> doors`.
    #[must_use]
    pub fn inner_markup(&self) -> String {
        let mut out = String::new();
        for item in &self.content {
            match item {
                XmlContent::Text(text) => out.push_str(text),
                XmlContent::Element(node) => out.push_str(&node.to_string()),
            }
        }
        out.trim().to_string()
    }
}

/// Renders the element as markup; attribute quotes are escaped, text is written as captured.
impl Display for XmlNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}", self.name)?;
        for (key, value) in &self.attributes {
            write!(f, " {key}=\"{}\"", value.replace('"', "&quot;"))?;
        }
        if self.content.is_empty() {
            return f.write_str("/>");
        }
        f.write_str(">")?;
        for item in &self.content {
            match item {
                XmlContent::Text(text) => f.write_str(text)?,
                XmlContent::Element(node) => write!(f, "{node}")?,
            }
        }
        write!(f, "</{}>", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_ignores_child_content_and_whitespace() {
        let node = XmlNode::new("Qualifier")
            .with_text("\n  ")
            .with_child(XmlNode::new("text").with_text("only with sunroof"))
            .with_text("\n");
        assert_eq!(node.text(), "");
        assert!(node.has_children());
    }

    #[test]
    fn adjacent_text_runs_merge() {
        let mut node = XmlNode::new("Note");
        node.push_text("torque ".into());
        node.push_text("25Nm".into());
        assert_eq!(node.content.len(), 1);
        assert_eq!(node.text(), "torque 25Nm");
    }

    #[test]
    fn inner_markup_renders_placeholders() {
        let node = XmlNode::new("text")
            .with_text("With ")
            .with_child(XmlNode::new("p1"))
            .with_text(" doors");
        assert_eq!(node.inner_markup(), "With <p1/> doors");
        assert_eq!(node.text(), "With  doors");
    }

    #[test]
    fn children_named_filters_in_document_order() {
        let node = XmlNode::new("Qualifier")
            .with_child(XmlNode::new("param").with_text("A"))
            .with_child(XmlNode::new("text").with_text("t"))
            .with_child(XmlNode::new("param").with_text("B"));
        let params = node.children_named("param").map(XmlNode::text).collect::<Vec<_>>();
        assert_eq!(params, vec!["A", "B"]);
    }

    #[test]
    fn display_renders_nested_markup_with_escaped_quotes() {
        let node = XmlNode::new("text")
            .with_attribute("hint", "say \"hi\"")
            .with_text("With ")
            .with_child(XmlNode::new("p1").with_attribute("unit", "in"))
            .with_text(" doors");
        assert_eq!(node.to_string(), "<text hint=\"say &quot;hi&quot;\">With <p1 unit=\"in\"/> doors</text>");
    }
}

//! Renders the tiny wire contract the client-runtime script consumes
//! (spec §6): `p.start`, `p.end`, `p.placeholder`, `p.loadCSS`, each
//! wrapped in `<script data-pipe>...</script>` except `loadCSS`, which is
//! wrapped in a plain `<script>...</script>`.

/// `<script data-pipe>p.start(i[, "scriptUrl"])</script>`
pub fn start(pipe_instance_name: &str, index: usize, script_url: Option<&str>) -> String {
    wrap_pipe(&format!(
        "{pipe}.start({index}{arg})",
        pipe = pipe_instance_name,
        index = index,
        arg = optional_string_arg(script_url)
    ))
}

/// `<script data-pipe>p.end(i[, "scriptUrl"])</script>`
pub fn end(pipe_instance_name: &str, index: usize, script_url: Option<&str>) -> String {
    wrap_pipe(&format!(
        "{pipe}.end({index}{arg})",
        pipe = pipe_instance_name,
        index = index,
        arg = optional_string_arg(script_url)
    ))
}

/// `<script data-pipe>p.placeholder(i)</script>`
pub fn placeholder(pipe_instance_name: &str, index: usize) -> String {
    wrap_pipe(&format!("{pipe_instance_name}.placeholder({index})"))
}

/// `<script>p.loadCSS("url")</script>`
pub fn load_css(pipe_instance_name: &str, url: &str) -> String {
    format!(
        "<script>{pipe}.loadCSS(\"{url}\")</script>",
        pipe = pipe_instance_name,
        url = escape_js_string(url)
    )
}

/// `<link rel="stylesheet" href="url">`
pub fn stylesheet_link(url: &str) -> String {
    format!("<link rel=\"stylesheet\" href=\"{}\">", escape_attr(url))
}

fn wrap_pipe(call: &str) -> String {
    format!("<script data-pipe>{call}</script>")
}

fn optional_string_arg(value: Option<&str>) -> String {
    match value {
        Some(v) => format!(", \"{}\"", escape_js_string(v)),
        None => String::new(),
    }
}

fn escape_js_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_without_script_url() {
        assert_eq!(start("p", 0, None), "<script data-pipe>p.start(0)</script>");
    }

    #[test]
    fn start_with_script_url() {
        assert_eq!(
            start("p", 0, Some("http://link2")),
            "<script data-pipe>p.start(0, \"http://link2\")</script>"
        );
    }

    #[test]
    fn placeholder_sentinel() {
        assert_eq!(placeholder("p", 3), "<script data-pipe>p.placeholder(3)</script>");
    }

    #[test]
    fn load_css_is_plain_script() {
        assert_eq!(load_css("p", "http://link"), "<script>p.loadCSS(\"http://link\")</script>");
    }

    #[test]
    fn stylesheet_link_tag() {
        assert_eq!(
            stylesheet_link("http://link"),
            "<link rel=\"stylesheet\" href=\"http://link\">"
        );
    }
}

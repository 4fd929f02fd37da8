//! Self-contained responses served at the listener's own identity: the
//! PAC file and the service index page.

use std::collections::HashMap;

/// MIME type browsers expect for proxy auto-config scripts.
pub const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";

/// Request path that serves the PAC file.
pub const PAC_PATH: &str = "/proxy.pac";

/// Renders the proxy auto-config script.
///
/// Dot-less hostnames (other than `localhost` itself) are sent to the
/// proxy as `<host>.localhost:<port>`, with DIRECT as fallback so an
/// unmapped name degrades to a normal DNS lookup.
pub fn render_pac(listen_port: u16) -> String {
    format!(
        "function FindProxyForURL(url, host) {{\n\
         \x20 if (host.indexOf(\".\") === -1 && host !== \"localhost\") {{\n\
         \x20   return \"PROXY \" + host + \".localhost:{listen_port}; DIRECT\";\n\
         \x20 }}\n\
         \x20 return \"DIRECT\";\n\
         }}\n"
    )
}

/// Renders the HTML index listing the currently discovered services.
pub fn render_index(mapping: &HashMap<String, u16>) -> String {
    let mut names: Vec<&str> = mapping.keys().map(String::as_str).collect();
    names.sort_unstable();

    let body = if names.is_empty() {
        "<p>No services found.</p>\n\
         <p>Start any server with a <code>NAME</code> to register it:</p>\n\
         <pre>NAME=myapp npm start</pre>\n"
            .to_string()
    } else {
        let items: String = names
            .iter()
            .map(|name| format!("  <li><a href=\"http://{name}/\">{name}</a></li>\n"))
            .collect();
        format!("<ul>\n{items}</ul>\n")
    };

    format!(
        "<!doctype html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
         <title>localhome</title>\n</head>\n<body>\n<h1>localhome</h1>\n\
         {body}<p><a href=\"{PAC_PATH}\">proxy.pac</a></p>\n</body>\n</html>\n"
    )
}

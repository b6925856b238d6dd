use crate::config::StationCredential;

// Probe paths phones and desktops hit to detect a captive network.
pub const PROBE_PATHS: [&str; 6] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/connecttest.txt",
    "/ncsi.txt",
    "/fwlink",
];

pub const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>CloudSwitch Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input[type=text],input[type=password]{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>CloudSwitch Setup</h1>
  <p class="muted">Enter your home network so the switch can reach the cloud.</p>
  <div class="card">
    <form action="/connect" method="get">
      <label>WiFi Network (SSID)</label><input name="ssid" type="text" maxlength="32" required>
      <label>Password</label><input name="password" type="password" maxlength="64">
      <button type="submit">Connect</button>
    </form>
  </div>
</body>
</html>
"#;

pub const CONNECTING_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>CloudSwitch Setup</title>
</head>
<body style="font-family:Arial,sans-serif;max-width:480px;margin:2rem auto;padding:0 1rem;color:#111">
  <h1>Connecting&hellip;</h1>
  <p>The switch is joining your network now. You can close this page.</p>
  <p style="color:#555">If the <code>ESP32_Setup</code> network comes back, the
  password was probably wrong; reconnect to it and try again.</p>
</body>
</html>
"#;

pub const MISSING_PARAMS_BODY: &str = "ssid and password query parameters are required";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Form,
    Connect,
    ProbeRedirect,
    Fallback,
}

pub fn classify(path: &str) -> Route {
    if path == "/" {
        return Route::Form;
    }
    if path == "/connect" {
        return Route::Connect;
    }
    if PROBE_PATHS.contains(&path) {
        return Route::ProbeRedirect;
    }
    Route::Fallback
}

// Fallback body for clients that ignore the 302.
pub fn probe_redirect_html(target: &str) -> String {
    format!(
        "<html><head><meta http-equiv=\"refresh\" content=\"0; url={target}\"></head>\
         <body>Redirecting to <a href=\"{target}\">setup</a>&hellip;</body></html>"
    )
}

pub fn split_uri(uri: &str) -> (&str, &str) {
    match uri.split_once('?') {
        Some((path, query)) => (path, query),
        None => (uri, ""),
    }
}

// None means the 404 path: a missing parameter, an empty ssid, or a value
// no station config could hold. An empty password is an open network.
pub fn parse_connect_query(query: &str) -> Option<StationCredential> {
    let mut ssid = None;
    let mut password = None;

    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        match key {
            "ssid" => ssid = Some(percent_decode(value)),
            "password" => password = Some(percent_decode(value)),
            _ => {}
        }
    }

    let ssid = ssid.filter(|value| !value.is_empty())?;
    let password = password?;
    StationCredential::new(&ssid, &password).ok()
}

// Malformed escapes pass through untouched rather than failing the value.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                (Some(hi), Some(lo)) => {
                    out.push(hi << 4 | lo);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_serves_the_form() {
        assert_eq!(classify("/"), Route::Form);
    }

    #[test]
    fn probe_paths_redirect() {
        for path in PROBE_PATHS {
            assert_eq!(classify(path), Route::ProbeRedirect, "{path}");
        }
    }

    #[test]
    fn unknown_paths_fall_back_to_the_form() {
        assert_eq!(classify("/favicon.ico"), Route::Fallback);
        assert_eq!(classify("/library/test/success.html"), Route::Fallback);
    }

    #[test]
    fn connect_is_never_swallowed_by_the_fallback() {
        assert_eq!(classify("/connect"), Route::Connect);
    }

    #[test]
    fn parses_a_full_submission() {
        let credential = parse_connect_query("ssid=HomeNet&password=hunter22").unwrap();
        assert_eq!(credential.ssid, "HomeNet");
        assert_eq!(credential.password, "hunter22");
    }

    #[test]
    fn decodes_form_encoding() {
        let credential =
            parse_connect_query("ssid=My+Home%21&password=p%40ss+word").unwrap();
        assert_eq!(credential.ssid, "My Home!");
        assert_eq!(credential.password, "p@ss word");
    }

    #[test]
    fn rejects_missing_params_and_empty_ssid() {
        assert_eq!(parse_connect_query("ssid=HomeNet"), None);
        assert_eq!(parse_connect_query("password=hunter22"), None);
        assert_eq!(parse_connect_query("ssid=&password=hunter22"), None);
        assert_eq!(parse_connect_query(""), None);
    }

    #[test]
    fn empty_password_provisions_an_open_network() {
        let credential = parse_connect_query("ssid=OpenNet&password=").unwrap();
        assert_eq!(credential.ssid, "OpenNet");
        assert_eq!(credential.password, "");
    }

    #[test]
    fn rejects_values_too_long_for_a_station_config() {
        let query = format!("ssid={}&password=pw", "s".repeat(33));
        assert_eq!(parse_connect_query(&query), None);
    }

    #[test]
    fn ignores_extra_params() {
        let credential =
            parse_connect_query("foo=bar&ssid=HomeNet&password=pw&baz").unwrap();
        assert_eq!(credential.ssid, "HomeNet");
    }

    #[test]
    fn splits_path_and_query() {
        assert_eq!(split_uri("/connect?ssid=a&password=b"), ("/connect", "ssid=a&password=b"));
        assert_eq!(split_uri("/generate_204"), ("/generate_204", ""));
    }

    #[test]
    fn malformed_escapes_pass_through() {
        assert_eq!(percent_decode("100%25"), "100%");
        assert_eq!(percent_decode("bad%zzescape"), "bad%zzescape");
        assert_eq!(percent_decode("trailing%2"), "trailing%2");
        assert_eq!(percent_decode("trailing%"), "trailing%");
    }
}

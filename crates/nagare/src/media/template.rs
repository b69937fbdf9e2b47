use std::sync::LazyLock;

use regex::Regex;

// DASH-IF IOP permits only the %0[width]d format suffix, so a single-digit
// width capture covers every legal form. A fixed-duration numbered timeline
// needs just two identifiers; the resolver carries them as typed fields
// instead of a substitution map.
static TOKEN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(RepresentationID|Number)(?:%0(\d)d)?\$").unwrap());

/// Expands `$RepresentationID$` and `$Number%0Nd$` in a segment template.
///
/// Tokens without a configured value stay in the output untouched, the same
/// way an unrecognized identifier would.
#[derive(Default)]
pub struct Template<'a> {
    representation_id: Option<&'a str>,
    number: Option<u64>,
}

impl<'a> Template<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn representation_id(mut self, id: &'a str) -> Self {
        self.representation_id = Some(id);
        self
    }

    pub fn number(mut self, number: u64) -> Self {
        self.number = Some(number);
        self
    }

    pub fn resolve(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut tail = 0;

        for caps in TOKEN_REGEX.captures_iter(template) {
            let token = caps.get(0).unwrap();
            out.push_str(&template[tail..token.start()]);
            tail = token.end();

            match self.expand(&caps) {
                Some(value) => out.push_str(&value),
                None => out.push_str(token.as_str()),
            }
        }

        out.push_str(&template[tail..]);
        out
    }

    fn expand(&self, caps: &regex::Captures<'_>) -> Option<String> {
        match &caps[1] {
            "RepresentationID" => self.representation_id.map(str::to_owned),
            _ => {
                let number = self.number?;
                // The width applies to the number only; identifiers carry
                // no format suffix.
                let width = caps
                    .get(2)
                    .map_or(0, |digit| digit.as_str().parse().unwrap_or(0));
                Some(format!("{number:0width$}"))
            }
        }
    }
}

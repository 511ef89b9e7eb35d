/// A trigger topic split into levels.
///
/// `+` matches exactly one level, `#` matches all remaining levels including
/// none, so `a/#` matches `a` itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicFilter {
    levels: Vec<Level>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Level {
    Literal(String),
    SingleWildcard,
    MultiWildcard,
}

impl TopicFilter {
    pub fn parse(filter: &str) -> Self {
        let levels = filter
            .split('/')
            .map(|level| match level {
                "+" => Level::SingleWildcard,
                "#" => Level::MultiWildcard,
                literal => Level::Literal(literal.to_string()),
            })
            .collect();
        Self { levels }
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level {
                Level::MultiWildcard => return true,
                Level::SingleWildcard => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }
        topic_levels.next().is_none()
    }
}

/// True when `topic` may be published to, i.e. carries no wildcard.
pub fn is_publishable(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(&['#', '+'][..])
}

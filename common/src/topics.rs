use crate::identity::DeviceIdentity;

pub const DISCOVERY_PREFIX: &str = "homeassistant";
pub const LIGHT_COMPONENT: &str = "light";
pub const ENTITY_SUFFIX: &str = "light";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub config: String,
    pub command: String,
    pub state: String,
    pub unique_id: String,
}

/// `homeassistant/light/<id>_light/{config,set,state}`
pub fn derive_topics(identity: &DeviceIdentity) -> TopicSet {
    let unique_id = format!("{identity}_{ENTITY_SUFFIX}");
    let base = format!("{DISCOVERY_PREFIX}/{LIGHT_COMPONENT}/{unique_id}");

    TopicSet {
        config: format!("{base}/config"),
        command: format!("{base}/set"),
        state: format!("{base}/state"),
        unique_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_discovery_layout() {
        let identity = DeviceIdentity::parse("a1b2c3").unwrap();
        let topics = derive_topics(&identity);

        assert_eq!(topics.config, "homeassistant/light/a1b2c3_light/config");
        assert_eq!(topics.command, "homeassistant/light/a1b2c3_light/set");
        assert_eq!(topics.state, "homeassistant/light/a1b2c3_light/state");
        assert_eq!(topics.unique_id, "a1b2c3_light");
    }

    #[test]
    fn topics_are_deterministic() {
        let identity = DeviceIdentity::parse("zz9900").unwrap();
        assert_eq!(derive_topics(&identity), derive_topics(&identity));
    }
}

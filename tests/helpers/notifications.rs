use serde_json::{json, Value};

/// Builds notification bodies shaped like the image service's.
#[derive(Clone)]
pub struct NotificationBuilder {
    publisher_id: Option<String>,
    extra: Value,
}

impl NotificationBuilder {
    pub fn new() -> Self {
        Self {
            publisher_id: None,
            extra: json!({
                "priority": "INFO",
                "timestamp": "2013-06-11 17:05:12.123456",
                "message_id": "4b5d8a2a-6b7e-4a8e-9bb1-0d4c1f7f6c9e"
            }),
        }
    }

    pub fn from_publisher(mut self, publisher_id: &str) -> Self {
        self.publisher_id = Some(publisher_id.to_string());
        self
    }

    fn build(&self, event_type: &str, image_id: &str) -> Vec<u8> {
        let mut body = json!({
            "event_type": event_type,
            "payload": {
                "id": image_id,
                "name": "cirros-0.3.1-x86_64",
                "disk_format": "qcow2",
                "size": 13147648
            }
        });
        if let Some(publisher) = &self.publisher_id {
            body["publisher_id"] = json!(publisher);
        }
        if let (Some(body), Some(extra)) = (body.as_object_mut(), self.extra.as_object()) {
            for (key, value) in extra {
                body.insert(key.clone(), value.clone());
            }
        }
        serde_json::to_vec(&body).expect("notification serializes")
    }

    pub fn image_create(&self, image_id: &str) -> Vec<u8> {
        self.build("image.create", image_id)
    }

    pub fn image_update(&self, image_id: &str) -> Vec<u8> {
        self.build("image.update", image_id)
    }

    pub fn image_delete(&self, image_id: &str) -> Vec<u8> {
        self.build("image.delete", image_id)
    }

    pub fn other(&self, event_type: &str, image_id: &str) -> Vec<u8> {
        self.build(event_type, image_id)
    }
}

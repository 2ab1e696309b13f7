use log::debug;
use serde::Deserialize;

use super::handler::Handler;
use crate::error::CommandError;

// Initial provision response that does not require any security policy.
const INIT_RESPONSE: &str = r#"<Provision xmlns="Provision:"><Policies><Policy><PolicyType>MS-WAP-Provisioning-XML</PolicyType><Status>1</Status><Data>&lt;wap-provisioningdoc&gt;&lt;characteristic type="SecurityPolicy"&gt;&lt;parm name="4131" value="1"/&gt;&lt;/characteristic&gt;&lt;characteristic type="Registry"&gt;&lt;characteristic type="HKLM\Comm\Security\Policy\LASSD\AE\{50C13377-C66D-400C-889E-C316FC4AB374}"&gt;&lt;parm name="AEFrequencyType" value="0"/&gt;&lt;parm name="AEFrequencyValue" value="0"/&gt;&lt;/characteristic&gt;&lt;characteristic type="HKLM\Comm\Security\Policy\LASSD"&gt;&lt;parm name="DeviceWipeThreshold" value="16"/&gt;&lt;parm name="CodewordFrequency" value="-1"/&gt;&lt;/characteristic&gt;&lt;characteristic type="HKLM\Comm\Security\Policy\LASSD\LAP\lap_pw"&gt;&lt;parm name="MinimumPasswordLength" value="1"/&gt;&lt;parm name="PasswordComplexity" value="2"/&gt;&lt;/characteristic&gt;&lt;/characteristic&gt;&lt;/wap-provisioningdoc&gt;</Data><PolicyKey>1</PolicyKey></Policy></Policies></Provision>"#;

// Second provision response that always succeeds.
const SECOND_RESPONSE: &str = r#"<Provision xmlns="Provision:"><Status>1</Status><Policies><Policy><PolicyType>MS-WAP-Provisioning-XML</PolicyType><Status>1</Status><PolicyKey>2</PolicyKey></Policy></Policies></Provision>"#;

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct ProvisionReq {
    policies: Policies,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Policies {
    policy: Policy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct Policy {
    policy_type: String,
    policy_key: String,
    status: i32,
}

impl Handler {
    pub(crate) fn handle_provision(&mut self) -> Result<(), CommandError> {
        self.resp.set_wbxml(true);

        let req: ProvisionReq = self.parse_body()?;
        debug!("Provision request: {req:?}");

        if req.policies.policy.policy_type != "MS-WAP-Provisioning-XML" {
            return Err(CommandError::BadRequest(format!(
                "invalid Provision PolicyType: {}",
                req.policies.policy.policy_type
            )));
        }

        // Initial request?
        if req.policies.policy.policy_key.is_empty() {
            self.resp.write(INIT_RESPONSE);
        } else {
            self.resp.write(SECOND_RESPONSE);
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};

use crate::config::{truncated, AgentConfig, NetworkConfig, MAX_SSID_LEN, MAX_WIFI_PASS_LEN};

pub const PROVISIONING_AP_SSID: &str = "CC Agent";
pub const PROVISIONING_AP_PASSWORD: &str = "ccagent-setup";

pub const CAPTIVE_PATHS: [&str; 7] = [
    "/",
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
  <title>CC Agent Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:640px;margin:2rem auto;padding:0 1rem;color:#111}
    h1{margin:0 0 .5rem}.card{border:1px solid #ddd;border-radius:10px;padding:1rem;margin-bottom:1rem}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
    button{padding:.55rem .9rem;margin-top:.8rem}
  </style>
</head>
<body>
  <h1>CC Agent Setup</h1>
  <p class="muted">Join a WiFi network and set the two status URLs to poll.</p>

  <div class="card">
    <h2>WiFi</h2>
    <label>SSID</label><input id="wifiSsid" type="text" maxlength="32">
    <label>Password (leave blank to keep current)</label><input id="wifiPass" type="password" maxlength="64">
  </div>

  <div class="card">
    <h2>Status</h2>
    <label>Url 1</label><input id="url1" type="text" maxlength="255">
    <label>Url 2</label><input id="url2" type="text" maxlength="255">
    <label>Refresh time (microseconds)</label><input id="refresh" type="text" maxlength="9">
    <button id="save">Save</button>
    <button id="restart">Restart Device</button>
  </div>

  <p id="status" class="muted"></p>

  <script>
    const q=(id)=>document.getElementById(id);

    async function api(path,opt){
      const r=await fetch(path,opt);let b={};
      try{b=await r.json();}catch(_){}
      if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));
      return b;
    }

    async function load(){
      const c=await api('/api/config');
      q('wifiSsid').value=c.wifiSsid||'';
      q('url1').value=c.url1||'';
      q('url2').value=c.url2||'';
      q('refresh').value=c.refresh||'';
    }

    q('save').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Saving...';
      try{
        const payload={
          wifiSsid:q('wifiSsid').value.trim(),
          wifiPass:q('wifiPass').value||undefined,
          url1:q('url1').value.trim(),
          url2:q('url2').value.trim(),
          refresh:q('refresh').value.trim(),
        };
        await api('/api/config',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        q('status').className='ok'; q('status').textContent='Saved. The device is connecting now.';
        q('wifiPass').value='';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });

    q('restart').addEventListener('click', async ()=>{
      q('status').className='muted'; q('status').textContent='Restarting...';
      try{await api('/api/restart',{method:'POST'});q('status').className='ok';q('status').textContent='Restart requested.';}
      catch(err){q('status').className='err';q('status').textContent=err.message;}
    });

    load().catch((err)=>{q('status').className='err';q('status').textContent=err.message;});
  </script>
</body>
</html>
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalConfigView {
    pub url1: String,
    pub url2: String,
    pub refresh: String,
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PortalUpdate {
    #[serde(default)]
    pub url1: String,
    #[serde(default)]
    pub url2: String,
    #[serde(default)]
    pub refresh: String,
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
}

/// Result of merging a portal submission into what was loaded at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalSubmission {
    pub config: AgentConfig,
    pub network: NetworkConfig,
    pub config_changed: bool,
    pub network_changed: bool,
}

pub fn build_portal_view(config: &AgentConfig, network: &NetworkConfig) -> PortalConfigView {
    PortalConfigView {
        url1: config.url1.clone(),
        url2: config.url2.clone(),
        refresh: config.refresh.clone(),
        wifi_ssid: network.wifi_ssid.clone(),
        wifi_pass_set: !network.wifi_pass.is_empty(),
    }
}

pub fn validate_portal_update(update: &PortalUpdate) -> Result<(), &'static str> {
    if update.wifi_ssid.trim().is_empty() {
        return Err("wifiSsid cannot be empty");
    }
    Ok(())
}

pub fn apply_portal_update(
    config: &AgentConfig,
    network: &NetworkConfig,
    update: PortalUpdate,
) -> PortalSubmission {
    let next_config = AgentConfig::new(&update.url1, &update.url2, &update.refresh);

    let next_network = NetworkConfig {
        wifi_ssid: truncated(update.wifi_ssid.trim(), MAX_SSID_LEN),
        wifi_pass: match update.wifi_pass {
            Some(pass) => truncated(&pass, MAX_WIFI_PASS_LEN),
            None => network.wifi_pass.clone(),
        },
    };

    PortalSubmission {
        config_changed: next_config != *config,
        network_changed: next_network != *network,
        config: next_config,
        network: next_network,
    }
}

//! HTML templates and the stylesheet for the web interface.

use anyhow::{Context, Result};
use minijinja::Environment;

const BASE: &str = r#"<!doctype html>
<html>
    <head>
        <meta charset="utf-8">
        <title>{{ title }} - Deployment</title>
        <link rel="stylesheet" href="css">
    </head>
    <body>
        <h1>Deployment: {{ title }}</h1>
        <div class="content">
            {% block content %}{% endblock %}
        </div>
    </body>
</html>
"#;

const SESSION: &str = r#"<div class="logout">
    {{ user }} - <a href="logout">Logout</a>
</div>
"#;

const LOGIN: &str = r#"{% extends "base.html" %}
{% block content %}
<form class="login" method="post" action="login?page={{ page|urlencode }}&amp;params={{ params|urlencode }}">
    <label>
        Username: <input type="text" name="username" autofocus>
    </label>
    <label>
        Password: <input type="password" name="password">
    </label>
    <button type="submit">Login</button>
</form>
{% endblock %}
"#;

const LIST: &str = r#"{% extends "base.html" %}
{% block content %}
{% include "session.html" %}
{% if deployments %}
<form>
    <ul class="items">
    {% for deployment in deployments %}
        <li>
            {{ deployment.name }}
            <button formaction="deploy" name="name" value="{{ deployment.name }}" formmethod="post">Deploy</button>
            <button formaction="edit" name="name" value="{{ deployment.name }}">Edit</button>
            {% if deployment.url %}<a href="{{ deployment.url }}">{{ deployment.status }}</a>{% else %}{{ deployment.status }}{% endif %}
        </li>
    {% endfor %}
    </ul>
    <p><button formaction="create">Create</button></p>
</form>
{% else %}
<p>No deployments found - <a href="create">create one</a></p>
{% endif %}
{% endblock %}
"#;

const FIELDS: &str = r#"{% for field in fields %}
{% if field.file %}
<label class="file">
    {{ field.label }}:
    <input type="file" name="{{ field.name }}" multiple>
</label>
<label>
    Names:
    <input type="text" name="{{ field.name }}_names" value="{{ field.value }}">
</label>
{% else %}
<label>
    {{ field.label }}:
    <input type="{{ field.input_type }}" name="{{ field.name }}" value="{{ field.value }}"{% if field.checked %} checked{% endif %}>
</label>
{% endif %}
{% endfor %}
"#;

const CREATE: &str = r#"{% extends "base.html" %}
{% block content %}
{% include "session.html" %}
{% if public_key %}
<div class="success">
    The deployment has been created. The new deploy key's public
    part is shown below. Register this key in the Git repository.
    You can <a href="edit?name={{ name|urlencode }}">edit the deployment</a>,
    <a href="list">go to the list</a> or create a new deployment.
</div>
<pre>{{ public_key }}</pre>
{% endif %}
<form class="edit" action="create" method="post" enctype="multipart/form-data">
    {% include "fields.html" %}
    <button>Update</button>
</form>
{% endblock %}
"#;

const EDIT: &str = r#"{% extends "base.html" %}
{% block content %}
{% include "session.html" %}
{% if public_key %}
<div class="success">
    The deployment has been updated. The {{ key_state }} deploy key's public
    part is shown below. Ensure that this key exists in the Git repository.
    You can edit the deployment configuration again or
    <a href="list">go to the list</a>.
</div>
<pre>{{ public_key }}</pre>
{% endif %}
<form class="edit" action="edit" method="post" enctype="multipart/form-data">
    <input type="hidden" name="old_name" value="{{ name }}">
    {% include "fields.html" %}
    <button>Update</button>
</form>
{% endblock %}
"#;

const DEPLOY_STATUS: &str = r#"{% extends "base.html" %}
{% block content %}
<div class="{{ state }}">
    The deployment of {{ name }} is in the "{{ state }}" state.
    The latest message is: <code>{{ message }}</code>.
    You can <a href="deploy?name={{ name|urlencode }}">view progress</a>.
    You can <a href="list">return to the list</a>.
</div>
{% endblock %}
"#;

const DEPLOY_STARTED: &str = r#"{% extends "base.html" %}
{% block content %}
<div class="success">
    The deployment of {{ name }} has started.
    You can <a href="deploy?name={{ name|urlencode }}">view progress</a>.
    You can <a href="list">return to the list</a>.
</div>
{% endblock %}
"#;

const DEPLOY_UNDERWAY: &str = r#"{% extends "base.html" %}
{% block content %}
<div class="error">
    Another deployment of {{ name }} is already underway.
    You can <a href="deploy?name={{ name|urlencode }}">view progress</a>.
</div>
{% endblock %}
"#;

const MESSAGE: &str = r#"{% extends "base.html" %}
{% block content %}
<div class="{{ kind }}">{{ message }}</div>
{% endblock %}
"#;

/// Build the template environment. Auto-escaping is on for every template
/// through the `.html` names.
pub fn environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    for (name, source) in [
        ("base.html", BASE),
        ("session.html", SESSION),
        ("login.html", LOGIN),
        ("list.html", LIST),
        ("fields.html", FIELDS),
        ("create.html", CREATE),
        ("edit.html", EDIT),
        ("deploy_status.html", DEPLOY_STATUS),
        ("deploy_started.html", DEPLOY_STARTED),
        ("deploy_underway.html", DEPLOY_UNDERWAY),
        ("message.html", MESSAGE),
    ] {
        env.add_template(name, source)
            .with_context(|| format!("failed to register template {name}"))?;
    }
    Ok(env)
}

/// The stylesheet served at `/css`.
pub const CSS: &str = r#"
body {
  font-family: -apple-system, "Segoe UI", "Roboto", "Ubuntu", "Droid Sans", "Helvetica Neue", "Helvetica", "Arial", sans-serif;
}
.content {
    margin: auto 20rem auto 20rem;
    padding: 2rem 2rem 2rem 10rem;
    border: 0.01rem solid #aaa;
    border-radius: 1rem;
    -webkit-box-shadow: 0 2px 3px rgba(10, 10, 10, 0.1), 0 0 0 1px rgba(10, 10, 10, 0.1);
    box-shadow: 0 2px 3px rgba(10, 10, 10, 0.1), 0 0 0 1px rgba(10, 10, 10, 0.1);
    text-align: left;
}
form.edit label.file + label {
    font-size: 90%;
    padding-left: 1rem;
}
form.login {
    max-width: 60%;
    text-align: center;
}
form.login label, form.edit label {
    display: block;
}
form.login label {
    text-align: right;
}
button {
    border: none;
    font-size: 90%;
    padding: 0.5rem;
    background-color: #99ff99;
    transition: background-color 0.2s linear;
}
button:active,
button:hover {
    background-color: #00ff00;

}
button::-moz-focus-inner {
    border: 0;
}
button:active, button:focus {
    outline: 0.01rem dashed #777;
    text-decoration: none;
}
button a {
    color: #000;
    text-decoration: none;
}
.logout {
    text-align: right;
    font-size: 90%;
    color: #777;
}
.logout a {
    color: #5555ff;
}
.logout a:hover {
    color: #ff5555;
}
pre {
    word-break: break-all;
    white-space: pre-line;
}
.success, .error, .starting, .progress {
    margin: auto 10rem auto 2rem;
    padding: 1rem 1rem 1rem 1rem;
    border-radius: 1rem;
    -webkit-box-shadow: 0 2px 3px rgba(10, 10, 10, 0.1), 0 0 0 1px rgba(10, 10, 10, 0.1);
    box-shadow: 0 2px 3px rgba(10, 10, 10, 0.1), 0 0 0 1px rgba(10, 10, 10, 0.1);
}
.success {
    border: 0.01rem solid #55ff55;
    background-color: #ccffcc;
}
.error {
    border: 0.01rem solid #ff5555;
    background-color: #ffcccc;
}
.starting {
    border: 0.01rem solid #666666;
    background-color: #eeeeee;
}
.progress {
    border: 0.01rem solid #5555ff;
    background-color: #ccccff;
}
"#;
